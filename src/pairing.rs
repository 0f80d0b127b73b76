//! Wireless-debugging pairing: a SPAKE2 exchange keyed by the 6-digit code
//! shown on the device, followed by an AES-128-GCM envelope carrying the
//! host's adbd-encoded public key.
//!
//! Pairing runs on its own connection to the pairing port, not the adb
//! transport port, and uses its own framing: a big-endian 8-byte prefix
//! `{u32 type, u32 length}` ahead of each payload.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tracing::debug;

use crate::auth::AdbKeyPair;
use crate::protocol::{AdbError, ProtocolViolation, MAX_PAYLOAD};
use crate::transport::Transport;

/// Envelope type word, "PAIR" read as a little-endian command word.
pub const A_PAIR: u32 = 0x52494150;

/// Role identities mixed into the PAKE transcript.
const CLIENT_NAME: &[u8] = b"adb pair client";
const SERVER_NAME: &[u8] = b"adb pair server";

/// HKDF info label for the envelope key.
const KEY_INFO: &[u8] = b"adb pairing_auth aes-128-gcm key";
const KEY_LEN: usize = 16;

/// Write one pairing envelope: big-endian type and length, then payload.
pub async fn write_envelope(transport: &mut Transport, payload: &[u8]) -> Result<(), AdbError> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&A_PAIR.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    transport.send_all(&frame).await
}

/// Read one pairing envelope, rejecting unknown types and oversize frames.
pub async fn read_envelope(transport: &mut Transport) -> Result<Vec<u8>, AdbError> {
    let header = transport.recv_exact(8).await?;
    let kind = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if kind != A_PAIR {
        return Err(ProtocolViolation::UnknownCommand(kind).into());
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_PAYLOAD {
        return Err(ProtocolViolation::OversizePayload {
            len,
            max: MAX_PAYLOAD,
        }
        .into());
    }
    transport.recv_exact(len as usize).await
}

/// Derive the 16-byte envelope key from the PAKE shared secret.
pub fn derive_envelope_key(secret: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut key = [0u8; KEY_LEN];
    hk.expand(KEY_INFO, &mut key).expect("HKDF expand failed");
    key
}

/// Per-direction AEAD nonce: little-endian message counter in the first
/// eight bytes. Each side numbers its own sends from zero.
pub fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Enrol `identity` with the daemon using the pairing code from the device
/// screen. Returns the daemon's acknowledgement payload.
///
/// A failed AEAD open means the two sides derived different keys, i.e. the
/// code was wrong: `PairingRejected`. EOF mid-exchange is `PairingAborted`.
pub async fn pair(
    mut transport: Transport,
    pairing_code: &str,
    identity: &AdbKeyPair,
    label: &str,
) -> Result<Vec<u8>, AdbError> {
    let (state, outbound) = Spake2::<Ed25519Group>::start_a(
        &Password::new(pairing_code.as_bytes()),
        &Identity::new(CLIENT_NAME),
        &Identity::new(SERVER_NAME),
    );
    write_envelope(&mut transport, &outbound)
        .await
        .map_err(eof_as_abort)?;

    let peer_msg = read_envelope(&mut transport).await.map_err(eof_as_abort)?;
    let secret = state
        .finish(&peer_msg)
        .map_err(|_| AdbError::PairingRejected)?;
    let key = derive_envelope_key(&secret);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key));

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&counter_nonce(0)),
            identity.encoded_public(label).as_slice(),
        )
        .map_err(|_| AdbError::PairingAborted)?;
    write_envelope(&mut transport, &sealed)
        .await
        .map_err(eof_as_abort)?;

    let ack = read_envelope(&mut transport).await.map_err(eof_as_abort)?;
    let peer_info = cipher
        .decrypt(Nonce::from_slice(&counter_nonce(0)), ack.as_slice())
        .map_err(|_| AdbError::PairingRejected)?;

    debug!("pairing complete, {} byte peer info", peer_info.len());
    transport.close().await;
    Ok(peer_info)
}

fn eof_as_abort(err: AdbError) -> AdbError {
    match err {
        AdbError::TransportClosed => AdbError::PairingAborted,
        other => other,
    }
}
