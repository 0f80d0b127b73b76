use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::debug;

use crate::handshake::{self, ConnectOptions, Greeting};
use crate::mux::{ConnectionEvent, Multiplexer};
use crate::protocol::AdbError;
use crate::stream::AdbStream;
use crate::transport::Transport;

/// An authenticated, multiplexed connection to an adbd daemon.
#[derive(Debug)]
pub struct AdbConnection {
    mux: Multiplexer,
    greeting: Greeting,
}

impl AdbConnection {
    /// Run the handshake over `transport`, then start the multiplexer.
    pub async fn connect(transport: Transport, options: ConnectOptions) -> Result<Self, AdbError> {
        let fut = handshake::perform(transport, &options);
        let (transport, greeting) = match options.handshake_deadline {
            Some(deadline) => timeout(deadline, fut)
                .await
                .map_err(|_| AdbError::Timeout)??,
            None => fut.await?,
        };
        debug!("adbd connected: {}", greeting.banner_str());

        let mux = Multiplexer::start(transport, &greeting);
        Ok(Self { mux, greeting })
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.greeting.version
    }

    /// Negotiated maximum payload size.
    pub fn max_data(&self) -> u32 {
        self.greeting.max_data
    }

    /// The daemon's CNXN banner, verbatim.
    pub fn banner(&self) -> &[u8] {
        &self.greeting.banner
    }

    /// The daemon's CNXN banner as text.
    pub fn banner_str(&self) -> String {
        self.greeting.banner_str()
    }

    /// Open a stream to `destination`, e.g. `shell:ls`, `tcp:8080`,
    /// `sync:`, `jdwp:<pid>`. The destination string is opaque to the
    /// client; adbd decides what it means.
    pub async fn open(&self, destination: &str) -> Result<AdbStream, AdbError> {
        self.mux.open(destination).await
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.mux.subscribe()
    }

    /// Execute a shell command and collect its output.
    pub async fn shell(&self, command: &str) -> Result<String, AdbError> {
        let mut stream = self.open(&format!("shell:{command}")).await?;
        let output = stream.read_to_end().await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Reboot the device, optionally into `bootloader` or `recovery`.
    pub async fn reboot(&self, target: Option<&str>) -> Result<(), AdbError> {
        let destination = match target {
            Some("bootloader") => "reboot:bootloader",
            Some("recovery") => "reboot:recovery",
            _ => "reboot:",
        };

        let mut stream = self.open(destination).await?;
        stream.close();
        Ok(())
    }

    /// Close every stream and tear the connection down.
    pub fn shutdown(&self) {
        self.mux.shutdown();
    }
}
