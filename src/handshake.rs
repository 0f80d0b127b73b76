use std::time::Duration;

use tracing::{debug, trace};

use crate::auth::KeyStore;
use crate::protocol::{
    encode_frame, AdbError, AuthType, Command, Message, ProtocolViolation, MAX_PAYLOAD,
    STLS_VERSION, VERSION, VERSION_SKIP_CHECKSUM,
};
use crate::transport::{TlsSettings, Transport};

/// Whether to accept an in-band TLS upgrade when the daemon offers one.
pub enum TlsPolicy {
    /// Answer STLS and upgrade the transport.
    PreferIfOffered(TlsSettings),
    /// Treat STLS as a protocol violation.
    Forbid,
}

/// Connection configuration.
pub struct ConnectOptions {
    /// Protocol version advertised in CNXN; also the outbound checksum policy.
    pub advertised_version: u32,
    /// Largest payload this side is willing to receive.
    pub advertised_max_data: u32,
    /// Banner placed in the CNXN payload, without the trailing NUL.
    pub system_banner: String,
    /// Identities tried in order against AUTH tokens.
    pub identities: KeyStore,
    /// User label appended to an enrolled public key.
    pub key_label: String,
    pub tls: TlsPolicy,
    /// Deadline for the whole CNXN/AUTH exchange.
    pub handshake_deadline: Option<Duration>,
    /// The device is known to use wireless debugging; an unaccepted key then
    /// surfaces as `PairingRequired` instead of `AuthenticationFailed`.
    pub pairing_required_hint: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            advertised_version: VERSION_SKIP_CHECKSUM,
            advertised_max_data: MAX_PAYLOAD,
            system_banner: "host::".to_string(),
            identities: KeyStore::new(),
            key_label: "tcpadb@host".to_string(),
            tls: TlsPolicy::PreferIfOffered(TlsSettings::default()),
            handshake_deadline: None,
            pairing_required_hint: false,
        }
    }
}

/// Result of a completed CNXN exchange.
#[derive(Debug, Clone)]
pub struct Greeting {
    /// Negotiated protocol version, `min(ours, theirs)`.
    pub version: u32,
    /// Negotiated payload ceiling, `min(ours, theirs)`.
    pub max_data: u32,
    /// The daemon's banner payload, verbatim.
    pub banner: Vec<u8>,
}

impl Greeting {
    pub fn banner_str(&self) -> String {
        String::from_utf8_lossy(&self.banner)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Drive CNXN/AUTH/STLS until the daemon's banner arrives.
///
/// Outbound frames carry computed checksums throughout: no version is
/// negotiated until the peer's CNXN, and a legacy peer validates every
/// frame. Inbound frames are decoded under the advertised version, which
/// together with the CNXN-arg0 clause accepts both peer generations.
pub(crate) async fn perform(
    mut transport: Transport,
    options: &ConnectOptions,
) -> Result<(Transport, Greeting), AdbError> {
    let mut banner = options.system_banner.clone().into_bytes();
    banner.push(0);
    transport
        .send_all(&encode_frame(
            Command::Cnxn,
            options.advertised_version,
            options.advertised_max_data,
            &banner,
            VERSION,
        ))
        .await?;

    let mut tried = 0usize;
    let mut sent_pubkey = false;
    let mut tls_done = false;

    loop {
        let (message, payload) = Message::read_from(
            &mut transport,
            options.advertised_version,
            options.advertised_max_data,
        )
        .await?;
        trace!(
            "handshake frame {} arg0={:#x} arg1={:#x} len={}",
            message.command,
            message.arg0,
            message.arg1,
            message.data_length
        );

        match message.command {
            Command::Cnxn => {
                let version = options.advertised_version.min(message.arg0);
                let max_data = options.advertised_max_data.min(message.arg1);
                debug!("connected, version {version:#x}, max_data {max_data}");
                return Ok((
                    transport,
                    Greeting {
                        version,
                        max_data,
                        banner: payload,
                    },
                ));
            }
            Command::Auth if message.arg0 == AuthType::Token as u32 => {
                if sent_pubkey {
                    // The daemon discarded the key it was just offered.
                    return Err(if options.pairing_required_hint {
                        AdbError::PairingRequired
                    } else {
                        AdbError::AuthenticationFailed
                    });
                }
                if let Some(identity) = options.identities.identities().get(tried) {
                    let signature = identity.sign_token(&payload)?;
                    tried += 1;
                    debug!("answering auth token with signature {tried}");
                    transport
                        .send_all(&encode_frame(
                            Command::Auth,
                            AuthType::Signature as u32,
                            0,
                            &signature,
                            VERSION,
                        ))
                        .await?;
                } else if let Some(primary) = options.identities.primary() {
                    let public = primary.encoded_public(&options.key_label);
                    sent_pubkey = true;
                    debug!("no identity accepted, offering public key for enrolment");
                    transport
                        .send_all(&encode_frame(
                            Command::Auth,
                            AuthType::RsaPublicKey as u32,
                            0,
                            &public,
                            VERSION,
                        ))
                        .await?;
                } else {
                    return Err(AdbError::AuthenticationFailed);
                }
            }
            Command::Stls => match &options.tls {
                TlsPolicy::PreferIfOffered(settings) if !tls_done => {
                    transport
                        .send_all(&encode_frame(Command::Stls, STLS_VERSION, 0, &[], VERSION))
                        .await?;
                    transport = transport.upgrade_to_tls(settings).await?;
                    tls_done = true;
                    debug!("transport upgraded to tls");
                }
                _ => return Err(ProtocolViolation::UnexpectedCommand(Command::Stls).into()),
            },
            other => return Err(ProtocolViolation::UnexpectedCommand(other).into()),
        }
    }
}
