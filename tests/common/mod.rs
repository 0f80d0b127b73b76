#![allow(dead_code)]

//! In-process fake adbd shared by the integration suites. Each test scripts
//! the daemon side of the conversation over a `tokio::io::duplex` pipe.

use tokio::io::{AsyncWriteExt, DuplexStream};

use tcpadb::protocol::{encode_frame, Command, Message, MAX_PAYLOAD, VERSION_SKIP_CHECKSUM};

/// Read one frame from the host. Checksums are not validated except for
/// legacy CNXN frames, mirroring a current-generation daemon.
pub async fn read_frame(io: &mut DuplexStream) -> (Message, Vec<u8>) {
    Message::read_from(io, VERSION_SKIP_CHECKSUM, MAX_PAYLOAD)
        .await
        .expect("daemon failed to read frame")
}

/// Send one frame to the host; `version` controls checksum semantics.
pub async fn send_frame(
    io: &mut DuplexStream,
    command: Command,
    arg0: u32,
    arg1: u32,
    data: &[u8],
    version: u32,
) {
    io.write_all(&encode_frame(command, arg0, arg1, data, version))
        .await
        .expect("daemon failed to send frame");
}

/// Accept the host's CNXN without authentication and answer with the
/// daemon's own banner.
pub async fn accept_plain(io: &mut DuplexStream, version: u32, max_data: u32, banner: &[u8]) {
    let (message, _) = read_frame(io).await;
    assert_eq!(message.command, Command::Cnxn);
    send_frame(io, Command::Cnxn, version, max_data, banner, version).await;
}
