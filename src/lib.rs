//! Rust TcpADB - ADB (Android Debug Bridge) client over TCP
//!
//! This library speaks the adb wire protocol directly to the `adbd` daemon
//! on a device: the 24-byte message framing, RSA token authentication with
//! key enrolment, the optional in-band TLS upgrade, SPAKE2 pairing for
//! wireless debugging, and any number of concurrently multiplexed streams
//! (shell sessions, port forwards, sync channels) over one connection.
//!
//! # Example
//!
//! ```no_run
//! use tcpadb::{AdbConnection, AdbKeyPair, ConnectOptions, Transport};
//!
//! # async fn demo() -> Result<(), tcpadb::AdbError> {
//! let transport = Transport::dial("192.168.1.44:5555").await?;
//!
//! let mut options = ConnectOptions::default();
//! options.identities.push(AdbKeyPair::generate()?);
//!
//! let connection = AdbConnection::connect(transport, options).await?;
//! println!("model: {}", connection.shell("getprop ro.product.model").await?);
//!
//! let mut stream = connection.open("tcp:8080").await?;
//! stream.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod auth;
pub mod client;
pub mod handshake;
pub mod mux;
pub mod pairing;
pub mod protocol;
pub mod stream;
pub mod transport;

// Re-export main types
pub use auth::{AdbKeyPair, KeyStore};
pub use client::AdbConnection;
pub use handshake::{ConnectOptions, Greeting, TlsPolicy};
pub use mux::ConnectionEvent;
pub use pairing::pair;
pub use protocol::{AdbError, AuthType, Command, Message, ProtocolViolation};
pub use stream::AdbStream;
pub use transport::{TlsSettings, TlsVerification, Transport};
