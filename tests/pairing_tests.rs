use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tcpadb::pairing::{counter_nonce, derive_envelope_key, pair, read_envelope, write_envelope};
use tcpadb::{AdbError, AdbKeyPair, ProtocolViolation, Transport};
use tokio::io::{duplex, AsyncWriteExt};

/// Device side of the pairing exchange: the same SPAKE2 roles from the
/// responder's perspective, sealing its acknowledgement under its own key.
/// Returns the peer info it managed to decrypt, empty on a key mismatch.
async fn run_daemon(mut io: Transport, code: &str, ack: &[u8]) -> Vec<u8> {
    let client_msg = read_envelope(&mut io).await.unwrap();

    let (state, outbound) = Spake2::<Ed25519Group>::start_b(
        &Password::new(code.as_bytes()),
        &Identity::new(b"adb pair client"),
        &Identity::new(b"adb pair server"),
    );
    write_envelope(&mut io, &outbound).await.unwrap();

    let secret = state.finish(&client_msg).unwrap();
    let key = derive_envelope_key(&secret);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key));

    let sealed = read_envelope(&mut io).await.unwrap();
    let peer_info = cipher
        .decrypt(Nonce::from_slice(&counter_nonce(0)), sealed.as_slice())
        .unwrap_or_default();

    let reply = cipher
        .encrypt(Nonce::from_slice(&counter_nonce(0)), ack)
        .unwrap();
    write_envelope(&mut io, &reply).await.unwrap();

    peer_info
}

#[tokio::test]
async fn pairing_succeeds_with_matching_code() {
    let (host, daemon) = duplex(64 * 1024);
    let identity = AdbKeyPair::generate().unwrap();
    let expected = identity.encoded_public("host@test");

    let daemon_task = tokio::spawn(async move {
        run_daemon(Transport::pipe(daemon), "123456", b"device-ack").await
    });

    let ack = pair(Transport::pipe(host), "123456", &identity, "host@test")
        .await
        .unwrap();
    assert_eq!(ack, b"device-ack");

    // The daemon enrolled exactly the key we offered.
    assert_eq!(daemon_task.await.unwrap(), expected);
}

#[tokio::test]
async fn pairing_rejected_on_wrong_code() {
    let (host, daemon) = duplex(64 * 1024);
    let identity = AdbKeyPair::generate().unwrap();

    let daemon_task = tokio::spawn(async move {
        run_daemon(Transport::pipe(daemon), "654321", b"device-ack").await
    });

    let err = pair(Transport::pipe(host), "123456", &identity, "host@test")
        .await
        .unwrap_err();
    assert_eq!(err, AdbError::PairingRejected);

    // The daemon could not read the enrolment envelope either.
    assert!(daemon_task.await.unwrap().is_empty());
}

#[tokio::test]
async fn pairing_aborted_when_daemon_hangs_up() {
    let (host, daemon) = duplex(64 * 1024);
    let identity = AdbKeyPair::generate().unwrap();

    let daemon_task = tokio::spawn(async move {
        let mut io = Transport::pipe(daemon);
        let _ = read_envelope(&mut io).await.unwrap();
        // Hang up before answering.
    });

    let err = pair(Transport::pipe(host), "123456", &identity, "host@test")
        .await
        .unwrap_err();
    assert_eq!(err, AdbError::PairingAborted);

    daemon_task.await.unwrap();
}

#[tokio::test]
async fn bogus_envelope_type_is_a_protocol_error() {
    let (host, mut daemon) = duplex(64 * 1024);
    let identity = AdbKeyPair::generate().unwrap();

    // The client's first envelope fits the pipe buffer, so the daemon can
    // answer without reading it.
    let mut bogus = Vec::new();
    bogus.extend_from_slice(&0x11223344u32.to_be_bytes());
    bogus.extend_from_slice(&0u32.to_be_bytes());
    daemon.write_all(&bogus).await.unwrap();

    let err = pair(Transport::pipe(host), "123456", &identity, "host@test")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AdbError::Protocol(ProtocolViolation::UnknownCommand(0x11223344))
    );

    drop(daemon);
}
