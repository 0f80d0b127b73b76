use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, trace};

use crate::handshake::Greeting;
use crate::protocol::{encode_frame, AdbError, Command, Message, ProtocolViolation};
use crate::stream::AdbStream;
use crate::transport::Transport;

/// Connection lifecycle events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The handshake finished; carries the daemon banner.
    Connected { banner: String },
    /// The connection shut down, orderly or not.
    Closed,
}

/// Why a stream stopped accepting operations.
#[derive(Debug, Clone)]
pub(crate) enum CloseCause {
    Refused,
    PeerClosed,
    LocallyClosed,
    Connection(AdbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Opening,
    Open,
    HalfClosed,
    Closed,
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    pub(crate) phase: Phase,
    pub(crate) read_queue: VecDeque<Vec<u8>>,
    pub(crate) write_ready: bool,
    pub(crate) close_cause: Option<CloseCause>,
}

/// Shared per-stream record. The reader task is the only mutator of
/// inbound state; caller tasks wait on the two notifies.
#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub(crate) local_id: u32,
    pub(crate) remote_id: AtomicU32,
    pub(crate) inner: Mutex<StreamInner>,
    pub(crate) readable: Notify,
    pub(crate) writable: Notify,
}

impl StreamEntry {
    fn new(local_id: u32) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            remote_id: AtomicU32::new(0),
            inner: Mutex::new(StreamInner {
                phase: Phase::Opening,
                read_queue: VecDeque::new(),
                write_ready: false,
                close_cause: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }
}

#[derive(Debug)]
struct StreamTable {
    map: HashMap<u32, Arc<StreamEntry>>,
    // Strictly monotonic, starting at 1; ids are never reused.
    next_local_id: u32,
}

#[derive(Debug)]
enum ConnState {
    Running,
    Closed(AdbError),
}

#[derive(Debug)]
pub(crate) struct MuxShared {
    version: u32,
    max_data: u32,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    streams: Mutex<StreamTable>,
    state: Mutex<ConnState>,
    closed: Notify,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MuxShared {
    pub(crate) fn max_data(&self) -> u32 {
        self.max_data
    }

    pub(crate) fn encode(&self, command: Command, arg0: u32, arg1: u32, data: &[u8]) -> Vec<u8> {
        encode_frame(command, arg0, arg1, data, self.version)
    }

    /// Queue one complete frame for the writer task.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> Result<(), AdbError> {
        let guard = self.out_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(self.close_error()),
        }
    }

    fn close_error(&self) -> AdbError {
        match &*self.state.lock().unwrap() {
            ConnState::Closed(err) => err.clone(),
            ConnState::Running => AdbError::ConnectionClosed,
        }
    }

    fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ConnState::Closed(_))
    }

    fn lookup(&self, local_id: u32) -> Option<Arc<StreamEntry>> {
        self.streams.lock().unwrap().map.get(&local_id).cloned()
    }

    /// Tear the connection down once: fail every stream with `cause`, send
    /// CLSE for the open ones, then close the outbound queue so the writer
    /// flushes and shuts the socket.
    pub(crate) fn shutdown(&self, cause: AdbError) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnState::Closed(_)) {
                return;
            }
            *state = ConnState::Closed(cause.clone());
        }
        debug!("connection shutdown: {cause}");

        let entries: Vec<Arc<StreamEntry>> = {
            let mut table = self.streams.lock().unwrap();
            table.map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let was_open = {
                let mut inner = entry.inner.lock().unwrap();
                let was_open = inner.phase == Phase::Open;
                if inner.phase != Phase::Closed {
                    inner.phase = Phase::Closed;
                    inner
                        .close_cause
                        .get_or_insert(CloseCause::Connection(cause.clone()));
                }
                was_open
            };
            entry.readable.notify_one();
            entry.writable.notify_one();
            if was_open {
                let remote = entry.remote_id.load(Ordering::Relaxed);
                let frame = self.encode(Command::Clse, entry.local_id, remote, &[]);
                let _ = self.send_frame(frame);
            }
        }

        drop(self.out_tx.lock().unwrap().take());
        self.closed.notify_one();
        let _ = self.events.send(ConnectionEvent::Closed);
    }

    /// Close one stream from the local side. Sends CLSE only when the peer
    /// still believes the stream is alive; a peer-initiated close is never
    /// echoed.
    pub(crate) fn close_stream(&self, entry: &Arc<StreamEntry>, cause: CloseCause) {
        let send_clse = {
            let mut inner = entry.inner.lock().unwrap();
            match inner.phase {
                Phase::Opening | Phase::Open => {
                    let was_open = inner.phase == Phase::Open;
                    inner.phase = Phase::Closed;
                    inner.close_cause = Some(cause);
                    inner.read_queue.clear();
                    was_open || entry.remote_id.load(Ordering::Relaxed) != 0
                }
                Phase::HalfClosed => {
                    inner.phase = Phase::Closed;
                    inner.close_cause = Some(cause);
                    inner.read_queue.clear();
                    false
                }
                Phase::Closed => false,
            }
        };
        entry.readable.notify_one();
        entry.writable.notify_one();
        self.streams.lock().unwrap().map.remove(&entry.local_id);
        if send_clse {
            let remote = entry.remote_id.load(Ordering::Relaxed);
            let frame = self.encode(Command::Clse, entry.local_id, remote, &[]);
            let _ = self.send_frame(frame);
        }
    }

    /// Route one inbound frame. Only stream traffic is legal once connected.
    fn dispatch(&self, message: Message, payload: Vec<u8>) -> Result<(), AdbError> {
        match message.command {
            Command::Okay => {
                self.on_okay(message.arg0, message.arg1);
                Ok(())
            }
            Command::Wrte => {
                self.on_wrte(message.arg0, message.arg1, payload);
                Ok(())
            }
            Command::Clse => {
                self.on_clse(message.arg0, message.arg1);
                Ok(())
            }
            other => Err(ProtocolViolation::UnexpectedCommand(other).into()),
        }
    }

    fn on_okay(&self, remote: u32, local: u32) {
        let Some(entry) = self.lookup(local) else {
            trace!("OKAY({remote}, {local}) for unknown stream");
            return;
        };
        let mut inner = entry.inner.lock().unwrap();
        match inner.phase {
            Phase::Opening => {
                entry.remote_id.store(remote, Ordering::Relaxed);
                inner.phase = Phase::Open;
                inner.write_ready = true;
                drop(inner);
                entry.readable.notify_one();
                entry.writable.notify_one();
            }
            Phase::Open => {
                inner.write_ready = true;
                drop(inner);
                entry.writable.notify_one();
            }
            _ => {}
        }
    }

    fn on_wrte(&self, remote: u32, local: u32, payload: Vec<u8>) {
        let entry = self.lookup(local);
        let accepted = match &entry {
            Some(entry) => {
                let mut inner = entry.inner.lock().unwrap();
                if inner.phase == Phase::Closed {
                    false
                } else {
                    inner.read_queue.push_back(payload);
                    true
                }
            }
            None => false,
        };
        if accepted {
            let entry = entry.unwrap();
            entry.readable.notify_one();
            // Each accepted WRTE is acknowledged immediately.
            let frame = self.encode(Command::Okay, local, remote, &[]);
            let _ = self.send_frame(frame);
        } else {
            trace!("WRTE for dead stream {local}, answering CLSE");
            let frame = self.encode(Command::Clse, local, remote, &[]);
            let _ = self.send_frame(frame);
        }
    }

    fn on_clse(&self, remote: u32, local: u32) {
        let Some(entry) = self.lookup(local) else {
            // An inbound CLSE is never echoed, known stream or not.
            trace!("CLSE({remote}, {local}) for unknown stream");
            return;
        };
        self.streams.lock().unwrap().map.remove(&local);

        let mut inner = entry.inner.lock().unwrap();
        match inner.phase {
            Phase::Opening => {
                inner.phase = Phase::Closed;
                inner.close_cause = Some(CloseCause::Refused);
            }
            Phase::Open => {
                // Queued payloads that arrived before the close are still
                // delivered; the stream reaches Closed once drained.
                inner.phase = if inner.read_queue.is_empty() {
                    Phase::Closed
                } else {
                    Phase::HalfClosed
                };
                inner.close_cause = Some(CloseCause::PeerClosed);
            }
            _ => {}
        }
        drop(inner);
        entry.readable.notify_one();
        entry.writable.notify_one();
    }
}

/// Handle to a running multiplexed connection.
#[derive(Debug)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    /// Split the transport and spawn the reader and writer tasks.
    pub(crate) fn start(transport: Transport, greeting: &Greeting) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(MuxShared {
            version: greeting.version,
            max_data: greeting.max_data,
            out_tx: Mutex::new(Some(out_tx)),
            streams: Mutex::new(StreamTable {
                map: HashMap::new(),
                next_local_id: 1,
            }),
            state: Mutex::new(ConnState::Running),
            closed: Notify::new(),
            events,
        });

        let (reader, writer) = tokio::io::split(transport);
        tokio::spawn(run_reader(shared.clone(), reader));
        tokio::spawn(run_writer(shared.clone(), writer, out_rx));

        let _ = shared.events.send(ConnectionEvent::Connected {
            banner: greeting.banner_str(),
        });
        Self { shared }
    }

    /// Open a stream to `destination`, returning once the daemon has
    /// answered with OKAY. A CLSE answer fails with `ConnectionRefused`.
    pub async fn open(&self, destination: &str) -> Result<AdbStream, AdbError> {
        if let ConnState::Closed(err) = &*self.shared.state.lock().unwrap() {
            return Err(err.clone());
        }

        let entry = {
            let mut table = self.shared.streams.lock().unwrap();
            let local_id = table.next_local_id;
            table.next_local_id += 1;
            let entry = StreamEntry::new(local_id);
            table.map.insert(local_id, entry.clone());
            entry
        };
        let mut guard = OpenGuard {
            shared: &self.shared,
            entry: &entry,
            armed: true,
        };

        let mut payload = destination.as_bytes().to_vec();
        payload.push(0);
        self.shared
            .send_frame(self.shared.encode(Command::Open, entry.local_id, 0, &payload))?;

        loop {
            {
                let inner = entry.inner.lock().unwrap();
                match inner.phase {
                    Phase::Opening => {}
                    Phase::Open => {
                        guard.armed = false;
                        debug!("stream {} open to {destination:?}", entry.local_id);
                        return Ok(AdbStream::new(self.shared.clone(), entry.clone()));
                    }
                    _ => {
                        guard.armed = false;
                        return Err(match inner.close_cause.clone() {
                            Some(CloseCause::Refused) => AdbError::ConnectionRefused,
                            Some(CloseCause::Connection(err)) => err,
                            _ => AdbError::StreamClosed,
                        });
                    }
                }
            }
            entry.readable.notified().await;
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Orderly teardown: CLSE every open stream, fail pending operations
    /// with `ConnectionClosed`, close the transport.
    pub fn shutdown(&self) {
        self.shared.shutdown(AdbError::ConnectionClosed);
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown(AdbError::ConnectionClosed);
    }
}

/// Removes the half-registered stream if `open` is cancelled before the
/// daemon answers, sending CLSE when the remote id is already known.
struct OpenGuard<'a> {
    shared: &'a Arc<MuxShared>,
    entry: &'a Arc<StreamEntry>,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.close_stream(self.entry, CloseCause::LocallyClosed);
        }
    }
}

/// Sole owner of the receive half; parses frames and dispatches them until
/// the transport fails, a violation occurs, or the connection shuts down.
async fn run_reader(shared: Arc<MuxShared>, mut reader: ReadHalf<Transport>) {
    let cause = loop {
        if shared.is_closed() {
            return;
        }
        let next = tokio::select! {
            _ = shared.closed.notified() => return,
            next = Message::read_from(&mut reader, shared.version, shared.max_data) => next,
        };
        match next {
            Ok((message, payload)) => {
                trace!(
                    "frame {} arg0={} arg1={} len={}",
                    message.command,
                    message.arg0,
                    message.arg1,
                    message.data_length
                );
                if let Err(violation) = shared.dispatch(message, payload) {
                    break violation;
                }
            }
            Err(err) => break err,
        }
    };
    debug!("reader task stopping: {cause}");
    shared.shutdown(cause);
}

/// Drains the outbound queue onto the send half, one complete frame per
/// buffer, and shuts the socket down once the queue closes.
async fn run_writer(
    shared: Arc<MuxShared>,
    mut writer: WriteHalf<Transport>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = result {
            debug!("transport write failed: {err}");
            shared.shutdown(AdbError::TransportClosed);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
