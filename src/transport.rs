use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::{
    rustls::{self, ClientConfig, RootCertStore, ServerName},
    TlsConnector,
};
use tracing::debug;

use crate::protocol::AdbError;

/// How the peer certificate is checked after an STLS upgrade.
///
/// adbd presents a self-signed certificate and trust comes from key
/// pairing rather than a CA, so `TrustAny` is the default.
pub enum TlsVerification {
    /// Accept any server certificate.
    TrustAny,
    /// Verify against the given trust anchors.
    CaRoots(RootCertStore),
}

/// Settings applied when the handshake upgrades the transport to TLS.
pub struct TlsSettings {
    /// SNI name presented to the peer. Defaults to `"adbd"`.
    pub server_name: Option<String>,
    pub verification: TlsVerification,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            server_name: None,
            verification: TlsVerification::TrustAny,
        }
    }
}

/// A bidirectional byte stream carrying ADB frames.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// In-memory pipe, used by the test suites and in-process embedders.
    Pipe(DuplexStream),
}

impl Transport {
    /// Connect a plain TCP transport to `addr`.
    pub async fn dial<A: ToSocketAddrs>(addr: A) -> Result<Self, AdbError> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            debug!("tcp connect failed: {e}");
            AdbError::TransportClosed
        })?;
        let _ = stream.set_nodelay(true);
        Ok(Transport::Tcp(stream))
    }

    pub fn tcp(stream: TcpStream) -> Self {
        Transport::Tcp(stream)
    }

    pub fn pipe(pipe: DuplexStream) -> Self {
        Transport::Pipe(pipe)
    }

    /// Write one complete buffer to the peer.
    pub async fn send_all(&mut self, bytes: &[u8]) -> Result<(), AdbError> {
        self.write_all(bytes)
            .await
            .map_err(|_| AdbError::TransportClosed)?;
        self.flush().await.map_err(|_| AdbError::TransportClosed)
    }

    /// Read exactly `n` bytes from the peer.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>, AdbError> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)
            .await
            .map_err(|_| AdbError::TransportClosed)?;
        Ok(buf)
    }

    /// Close the write side; the peer observes EOF.
    pub async fn close(&mut self) {
        let _ = self.shutdown().await;
    }

    /// Wrap the underlying TCP stream in TLS. Only valid on a plain TCP
    /// transport, after the STLS frame exchange.
    pub async fn upgrade_to_tls(self, settings: &TlsSettings) -> Result<Self, AdbError> {
        let stream = match self {
            Transport::Tcp(stream) => stream,
            _ => {
                return Err(AdbError::Tls(
                    "tls upgrade requires a plain tcp transport".to_string(),
                ))
            }
        };

        let connector = TlsConnector::from(client_config(&settings.verification));
        let name = settings.server_name.as_deref().unwrap_or("adbd");
        let server_name = ServerName::try_from(name)
            .map_err(|e| AdbError::Tls(format!("invalid server name {name:?}: {e}")))?;

        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| AdbError::Tls(format!("tls handshake failed: {e}")))?;
        Ok(Transport::Tls(Box::new(tls)))
    }
}

fn client_config(verification: &TlsVerification) -> Arc<ClientConfig> {
    match verification {
        TlsVerification::TrustAny => Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
        ),
        TlsVerification::CaRoots(roots) => Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots.clone())
                .with_no_client_auth(),
        ),
    }
}

/// Certificate verifier that accepts any server certificate.
struct NoVerifier;

impl rustls::client::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Pipe(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Pipe(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Pipe(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Pipe(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
