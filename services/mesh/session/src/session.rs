//! Peer sessions.
//!
//! A `PeerSession` owns one live TCP socket. Reads run in their own task and
//! hand each completed read to the installed `SessionHandler`; writes go
//! through an unbounded queue drained by a writer task, so `send` never blocks
//! the caller.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Size of the per-session receive buffer. One read is one logical message.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// Best-effort notice written to a peer before an orderly disconnect
pub const DISCONNECT_NOTICE: &[u8] = b"disconnecting";

/// How the session's socket was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkDirection::Inbound => write!(f, "inbound"),
            LinkDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Callbacks installed on a session at creation.
///
/// `on_message` runs inline in the read task: the next read is issued only
/// after it returns. `on_disconnect` fires at most once per session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// A read completed with `payload`
    async fn on_message(&self, session: &Arc<PeerSession>, payload: Bytes);

    /// The socket failed on read or write
    async fn on_disconnect(&self, session: &Arc<PeerSession>);
}

enum Outgoing {
    Payload(Bytes),
    Close,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FailureOrigin {
    Read,
    Write,
}

struct PendingIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
}

/// One live connection to a remote peer
pub struct PeerSession {
    peer_id: RwLock<String>,
    remote_addr: Option<SocketAddr>,
    direction: LinkDirection,
    handler: Arc<dyn SessionHandler>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending_io: Mutex<Option<PendingIo>>,
    open: AtomicBool,
    disconnect_fired: AtomicBool,
    last_active: Mutex<Instant>,
    announced: Mutex<Option<String>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerSession {
    /// Wrap a connected stream. Nothing is read or written until
    /// `start_receiving` is called.
    pub fn new(
        stream: TcpStream,
        peer_id: impl Into<String>,
        direction: LinkDirection,
        handler: Arc<dyn SessionHandler>,
    ) -> Arc<Self> {
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            peer_id: RwLock::new(peer_id.into()),
            remote_addr,
            direction,
            handler,
            outgoing,
            pending_io: Mutex::new(Some(PendingIo {
                reader,
                writer,
                outgoing_rx,
            })),
            open: AtomicBool::new(true),
            disconnect_fired: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            announced: Mutex::new(None),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        })
    }

    /// Spawn the read and write tasks on the current runtime. Calling it a
    /// second time does nothing.
    pub fn start_receiving(self: &Arc<Self>) {
        let Some(io) = lock(&self.pending_io).take() else {
            return;
        };

        let writer = tokio::spawn(Arc::clone(self).write_loop(io.writer, io.outgoing_rx));
        *lock(&self.writer_task) = Some(writer);

        let reader = tokio::spawn(Arc::clone(self).read_loop(io.reader));
        *lock(&self.reader_task) = Some(reader);
    }

    /// Queue `payload` as one write. No-op once the socket is closed.
    pub fn send(&self, payload: impl Into<Bytes>) {
        if !self.is_connected() {
            return;
        }
        let _ = self.outgoing.send(Outgoing::Payload(payload.into()));
    }

    /// Close the socket without invoking the disconnect handler.
    ///
    /// Writes queued before the close are still flushed by the writer task.
    pub fn close(&self) {
        self.disconnect_fired.store(true, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(Outgoing::Close);
        }
        if let Some(reader) = lock(&self.reader_task).take() {
            reader.abort();
        }
    }

    /// Hand over the writer task so a caller can wait for queued writes
    pub fn take_writer_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.writer_task).take()
    }

    /// Whether the socket is still open
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Current identity key
    pub fn peer_id(&self) -> String {
        self.peer_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the identity key
    pub fn set_peer_id(&self, peer_id: impl Into<String>) {
        *self.peer_id.write().unwrap_or_else(PoisonError::into_inner) = peer_id.into();
    }

    /// Listening address the remote announced in its handshake, if any
    pub fn announced_address(&self) -> Option<String> {
        lock(&self.announced).clone()
    }

    pub(crate) fn set_announced_address(&self, address: impl Into<String>) {
        *lock(&self.announced) = Some(address.into());
    }

    /// Remote socket address of the underlying stream
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Time of the last successful read (or creation)
    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    /// `Address: <id> | Last active: <n> seconds ago`
    pub fn summary(&self) -> String {
        format!(
            "Address: {} | Last active: {} seconds ago",
            self.peer_id(),
            self.last_active().elapsed().as_secs()
        )
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => {
                    debug!(peer = %self.peer_id(), "Connection closed by remote");
                    self.fail(FailureOrigin::Read).await;
                    break;
                }
                Ok(n) => {
                    *lock(&self.last_active) = Instant::now();
                    let payload = Bytes::copy_from_slice(&buffer[..n]);
                    self.handler.on_message(&self, payload).await;
                }
                Err(e) => {
                    warn!(peer = %self.peer_id(), "Read failed: {}", e);
                    self.fail(FailureOrigin::Read).await;
                    break;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        while let Some(item) = outgoing_rx.recv().await {
            match item {
                Outgoing::Payload(payload) => {
                    if let Err(e) = writer.write_all(&payload).await {
                        warn!(peer = %self.peer_id(), "Write failed: {}", e);
                        self.fail(FailureOrigin::Write).await;
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    }

    async fn fail(self: &Arc<Self>, origin: FailureOrigin) {
        self.open.store(false, Ordering::SeqCst);

        // The read task may be the caller; only cancel it from the writer side.
        let reader = lock(&self.reader_task).take();
        if origin == FailureOrigin::Write {
            if let Some(reader) = reader {
                reader.abort();
            }
        } else {
            let _ = self.outgoing.send(Outgoing::Close);
        }

        if !self.disconnect_fired.swap(true, Ordering::SeqCst) {
            self.handler.on_disconnect(self).await;
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id())
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("open", &self.is_connected())
            .finish()
    }
}
