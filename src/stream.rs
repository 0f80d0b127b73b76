use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::mux::{CloseCause, MuxShared, Phase, StreamEntry, StreamInner};
use crate::protocol::{AdbError, Command};

/// Handle to one open logical stream.
///
/// Reads deliver payloads in arrival order and return `Ok(0)` once the
/// peer has closed and the queue is drained. Writes are gated by ADB flow
/// control: every WRTE must be acknowledged by an OKAY before the next.
#[derive(Debug)]
pub struct AdbStream {
    shared: Arc<MuxShared>,
    entry: Arc<StreamEntry>,
}

impl AdbStream {
    pub(crate) fn new(shared: Arc<MuxShared>, entry: Arc<StreamEntry>) -> Self {
        Self { shared, entry }
    }

    /// Stream ids as (local, remote).
    pub fn ids(&self) -> (u32, u32) {
        (
            self.entry.local_id,
            self.entry.remote_id.load(Ordering::Relaxed),
        )
    }

    /// Read into `buf`, blocking until data arrives or the stream ends.
    /// Returns 0 only at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, AdbError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inner = self.entry.inner.lock().unwrap();
                if let Some(front) = inner.read_queue.front_mut() {
                    let n = front.len().min(buf.len());
                    buf[..n].copy_from_slice(&front[..n]);
                    if n == front.len() {
                        inner.read_queue.pop_front();
                    } else {
                        front.drain(..n);
                    }
                    if inner.phase == Phase::HalfClosed && inner.read_queue.is_empty() {
                        inner.phase = Phase::Closed;
                    }
                    return Ok(n);
                }
                match inner.phase {
                    Phase::Closed | Phase::HalfClosed => {
                        return match inner.close_cause.clone() {
                            Some(CloseCause::PeerClosed) => Ok(0),
                            Some(CloseCause::Connection(err)) => Err(err),
                            _ => Err(AdbError::StreamClosed),
                        };
                    }
                    _ => {}
                }
            }
            self.entry.readable.notified().await;
        }
    }

    /// Read until end of stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AdbError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write all of `buf`, chunked at the negotiated payload ceiling.
    /// Returns once every chunk has been sent and acknowledged.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), AdbError> {
        if buf.is_empty() {
            return Ok(());
        }
        for chunk in buf.chunks(self.shared.max_data() as usize) {
            self.acquire_permit().await?;
            let remote = self.entry.remote_id.load(Ordering::Relaxed);
            self.shared.send_frame(self.shared.encode(
                Command::Wrte,
                self.entry.local_id,
                remote,
                chunk,
            ))?;
        }
        self.await_final_okay().await
    }

    /// Take the write permit; the reader reopens it on the matching OKAY.
    async fn acquire_permit(&self) -> Result<(), AdbError> {
        loop {
            {
                let mut inner = self.entry.inner.lock().unwrap();
                match inner.phase {
                    Phase::Open if inner.write_ready => {
                        inner.write_ready = false;
                        return Ok(());
                    }
                    Phase::Open => {}
                    _ => return Err(closed_error(&inner)),
                }
            }
            self.entry.writable.notified().await;
        }
    }

    /// Wait for the last chunk's OKAY without consuming the permit.
    async fn await_final_okay(&self) -> Result<(), AdbError> {
        loop {
            {
                let inner = self.entry.inner.lock().unwrap();
                match inner.phase {
                    Phase::Open if inner.write_ready => return Ok(()),
                    Phase::Open => {}
                    _ => return Err(closed_error(&inner)),
                }
            }
            self.entry.writable.notified().await;
        }
    }

    /// Close the stream. Idempotent; pending reads and writes fail with
    /// `StreamClosed`.
    pub fn close(&mut self) {
        self.shared
            .close_stream(&self.entry, CloseCause::LocallyClosed);
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        self.shared
            .close_stream(&self.entry, CloseCause::LocallyClosed);
    }
}

fn closed_error(inner: &StreamInner) -> AdbError {
    match inner.close_cause.clone() {
        Some(CloseCause::Connection(err)) => err,
        _ => AdbError::StreamClosed,
    }
}
