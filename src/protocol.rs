use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Baseline ADB protocol version.
pub const VERSION: u32 = 0x01000000;

/// First version at which payload checksums are no longer validated.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x01000001;

/// Version word carried in an outbound STLS frame.
pub const STLS_VERSION: u32 = 0x01000000;

/// Maximum data payload advertised by pre-API-24 devices.
pub const MAX_PAYLOAD_LEGACY: u32 = 4 * 1024;

/// Maximum data payload advertised by API 24+ devices.
pub const MAX_PAYLOAD_V2: u32 = 256 * 1024;

/// Maximum data payload this client advertises (the API 28+ value).
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// ADB command constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Synchronize (legacy; rejected when received)
    Sync = 0x434e5953,
    /// Connect
    Cnxn = 0x4e584e43,
    /// Authentication
    Auth = 0x48545541,
    /// Open stream
    Open = 0x4e45504f,
    /// OK/Ready
    Okay = 0x59414b4f,
    /// Close stream
    Clse = 0x45534c43,
    /// Write data
    Wrte = 0x45545257,
    /// Upgrade the connection to TLS
    Stls = 0x534c5453,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x434e5953 => Some(Command::Sync),
            0x4e584e43 => Some(Command::Cnxn),
            0x48545541 => Some(Command::Auth),
            0x4e45504f => Some(Command::Open),
            0x59414b4f => Some(Command::Okay),
            0x45534c43 => Some(Command::Clse),
            0x45545257 => Some(Command::Wrte),
            0x534c5453 => Some(Command::Stls),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Sync => write!(f, "SYNC"),
            Command::Cnxn => write!(f, "CNXN"),
            Command::Auth => write!(f, "AUTH"),
            Command::Open => write!(f, "OPEN"),
            Command::Okay => write!(f, "OKAY"),
            Command::Clse => write!(f, "CLSE"),
            Command::Wrte => write!(f, "WRTE"),
            Command::Stls => write!(f, "STLS"),
        }
    }
}

/// Authentication types carried in AUTH `arg0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Token (challenge from device)
    Token = 1,
    /// Signature (response to challenge)
    Signature = 2,
    /// RSA public key
    RsaPublicKey = 3,
}

impl AuthType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AuthType::Token),
            2 => Some(AuthType::Signature),
            3 => Some(AuthType::RsaPublicKey),
            _ => None,
        }
    }
}

/// ADB message header (24 bytes)
#[derive(Debug, Clone)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
    pub magic: u32,
}

impl Message {
    pub const HEADER_SIZE: usize = 24;

    /// Create a new header for `data` under the given protocol version.
    ///
    /// The checksum is computed for non-empty payloads under the baseline
    /// version and transmitted as zero once both ends have negotiated
    /// [`VERSION_SKIP_CHECKSUM`].
    pub fn new(command: Command, arg0: u32, arg1: u32, data: &[u8], version: u32) -> Self {
        let data_length = data.len() as u32;
        let data_checksum = if data.is_empty() || version > VERSION {
            0
        } else {
            checksum(data)
        };
        let magic = (command as u32) ^ 0xffffffff;

        Self {
            command,
            arg0,
            arg1,
            data_length,
            data_checksum,
            magic,
        }
    }

    /// Serialize the header to bytes (little-endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_SIZE);
        bytes.extend_from_slice(&(self.command as u32).to_le_bytes());
        bytes.extend_from_slice(&self.arg0.to_le_bytes());
        bytes.extend_from_slice(&self.arg1.to_le_bytes());
        bytes.extend_from_slice(&self.data_length.to_le_bytes());
        bytes.extend_from_slice(&self.data_checksum.to_le_bytes());
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes
    }

    /// Deserialize a header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(AdbError::TransportClosed);
        }

        let raw_command = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let arg0 = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let arg1 = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let data_length = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let data_checksum = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let magic = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);

        // The magic is checked against the raw command word so corruption is
        // reported as BadMagic even when the command itself is unreadable.
        if magic != raw_command ^ 0xffffffff {
            return Err(ProtocolViolation::BadMagic {
                command: raw_command,
                magic,
            }
            .into());
        }

        let command = Command::from_u32(raw_command)
            .ok_or(ProtocolViolation::UnknownCommand(raw_command))?;

        Ok(Self {
            command,
            arg0,
            arg1,
            data_length,
            data_checksum,
            magic,
        })
    }

    /// Read one complete frame (header plus payload) off `reader`.
    ///
    /// The payload checksum is validated when `version` is the baseline, or
    /// when the frame is a CNXN whose advertised version is the baseline (a
    /// legacy peer checksums everything regardless of what we advertise).
    pub async fn read_from<R>(
        reader: &mut R,
        version: u32,
        max_data: u32,
    ) -> Result<(Self, Vec<u8>), AdbError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; Self::HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|_| AdbError::TransportClosed)?;
        let message = Self::from_bytes(&header)?;

        if message.data_length > max_data {
            return Err(ProtocolViolation::OversizePayload {
                len: message.data_length,
                max: max_data,
            }
            .into());
        }

        let mut payload = vec![0u8; message.data_length as usize];
        if !payload.is_empty() {
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|_| AdbError::TransportClosed)?;
        }

        let validate =
            version <= VERSION || (message.command == Command::Cnxn && message.arg0 <= VERSION);
        if validate && !message.verify_data(&payload) {
            return Err(ProtocolViolation::ChecksumMismatch {
                expected: message.data_checksum,
                actual: checksum(&payload),
            }
            .into());
        }

        Ok((message, payload))
    }

    /// Verify data checksum
    pub fn verify_data(&self, data: &[u8]) -> bool {
        if self.data_length as usize != data.len() {
            return false;
        }
        if data.is_empty() {
            return self.data_checksum == 0;
        }
        checksum(data) == self.data_checksum
    }
}

/// Encode a complete frame: 24-byte header immediately followed by the
/// payload, in one buffer so the transport never interleaves mid-header.
pub fn encode_frame(command: Command, arg0: u32, arg1: u32, data: &[u8], version: u32) -> Vec<u8> {
    let message = Message::new(command, arg0, arg1, data, version);
    let mut bytes = Vec::with_capacity(Message::HEADER_SIZE + data.len());
    bytes.extend_from_slice(&message.to_bytes());
    bytes.extend_from_slice(data);
    bytes
}

/// Payload checksum: wrapping sum of the payload bytes as a u32.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Fatal wire-level violations; the connection is torn down on any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("magic {magic:#010x} does not match command {command:#010x}")]
    BadMagic { command: u32, magic: u32 },

    #[error("unknown command {0:#010x}")]
    UnknownCommand(u32),

    #[error("payload of {len} bytes exceeds the negotiated maximum of {max}")]
    OversizePayload { len: u32, max: u32 },

    #[error("payload checksum {actual:#010x} does not match header {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("{0} not valid in this connection state")]
    UnexpectedCommand(Command),
}

/// ADB errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdbError {
    #[error("transport closed")]
    TransportClosed,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("daemon did not accept any identity")]
    AuthenticationFailed,

    #[error("device requires pairing")]
    PairingRequired,

    #[error("pairing code rejected by device")]
    PairingRejected,

    #[error("pairing aborted before completion")]
    PairingAborted,

    #[error("stream refused by device")]
    ConnectionRefused,

    #[error("stream is closed")]
    StreamClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("tls error: {0}")]
    Tls(String),

    #[error("key error: {0}")]
    Key(String),
}
