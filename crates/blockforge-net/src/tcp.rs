//! TCP listener and per-connection tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use blockforge_session::{NetworkBackend, Session, SessionError, SessionId};
use flume::RecvTimeoutError;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{MAX_NAME_LEN, NetError};

/// Longest line, in bytes without the terminator, a client may send after
/// logging in. A longer line closes the connection.
pub const MAX_LINE_LEN: usize = 1024;

/// Cap on the first line, which carries the login name.
const LOGIN_LINE_LEN: usize = MAX_NAME_LEN + 16;

/// Counter for generating unique session IDs.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Pause after a failed `accept()` so a persistent error doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Live sessions by id, shared between the network and its handshake.
pub(crate) type SessionTable = Arc<Mutex<HashMap<SessionId, Weak<TcpSession>>>>;

// ---------------------------------------------------------------------------
// TcpNetwork
// ---------------------------------------------------------------------------

/// A listening TCP socket with its own I/O runtime.
///
/// Must be created and dropped outside any tokio runtime: it owns one.
pub struct TcpNetwork {
    runtime: Option<Runtime>,
    local_addr: SocketAddr,
    pending: flume::Receiver<Arc<TcpSession>>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    table: SessionTable,
}

impl TcpNetwork {
    /// Binds `addr` and starts accepting in the background.
    ///
    /// # Errors
    /// [`NetError::Runtime`] if the I/O runtime can't start,
    /// [`NetError::Bind`] if the address can't be bound.
    pub fn bind(addr: &str) -> Result<Self, NetError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("blockforge-net")
            .enable_all()
            .build()
            .map_err(NetError::Runtime)?;

        let listener = runtime
            .block_on(TcpListener::bind(addr))
            .map_err(|source| NetError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| NetError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        tracing::info!(%local_addr, "TCP network listening");

        let table: SessionTable = Arc::default();
        let (tx, pending) = flume::unbounded();
        let accept_loop = runtime.spawn(accept_loop(listener, tx, Arc::clone(&table)));

        Ok(Self {
            runtime: Some(runtime),
            local_addr,
            pending,
            accept_loop: Mutex::new(Some(accept_loop)),
            accepting: AtomicBool::new(true),
            table,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections whose I/O task is still running.
    pub fn live_connections(&self) -> usize {
        self.table.lock().len()
    }

    /// The concrete session behind an id handed out by `accept_pending`,
    /// while its connection is open.
    pub fn session(&self, id: SessionId) -> Option<Arc<TcpSession>> {
        self.table.lock().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn table(&self) -> SessionTable {
        Arc::clone(&self.table)
    }
}

impl NetworkBackend for TcpNetwork {
    fn accept_pending(&self) -> Result<Option<Arc<dyn Session>>, SessionError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.pending.try_recv() {
            Ok(session) => Ok(Some(session as Arc<dyn Session>)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(SessionError::AcceptFailed(
                format!("listener on {} is gone", self.local_addr),
            )),
        }
    }

    fn stop_accepting(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.accept_loop.lock().take() {
            task.abort();
        }
        // Connections accepted but never handed out.
        for session in self.pending.drain() {
            session.close();
        }
        tracing::info!(local_addr = %self.local_addr, "TCP network stopped accepting");
    }
}

impl Drop for TcpNetwork {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for TcpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpNetwork")
            .field("local_addr", &self.local_addr)
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: flume::Sender<Arc<TcpSession>>,
    table: SessionTable,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let session = TcpSession::spawn(stream, peer, Arc::clone(&table));
                tracing::debug!(session = %session.id(), %peer, "accepted TCP connection");
                if tx.send(session).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TcpSession
// ---------------------------------------------------------------------------

enum Outbound {
    Line(String),
    Close,
}

/// State the connection task updates and the session reads.
struct Liveness {
    online: AtomicBool,
    last_active: Mutex<Instant>,
}

/// One accepted TCP connection.
pub struct TcpSession {
    id: SessionId,
    addr: SocketAddr,
    created_at: Instant,
    liveness: Arc<Liveness>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: flume::Receiver<String>,
    /// Never receives; disconnects when the connection task ends.
    finished: flume::Receiver<()>,
}

impl TcpSession {
    fn spawn(stream: TcpStream, addr: SocketAddr, table: SessionTable) -> Arc<Self> {
        let id = SessionId::new(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let liveness = Arc::new(Liveness {
            online: AtomicBool::new(true),
            last_active: Mutex::new(now),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = flume::unbounded();
        let (alive_tx, finished) = flume::bounded(0);

        let session = Arc::new(Self {
            id,
            addr,
            created_at: now,
            liveness: Arc::clone(&liveness),
            outbound: out_tx,
            inbound: in_rx,
            finished,
        });
        table.lock().insert(id, Arc::downgrade(&session));

        tokio::spawn(async move {
            drive(stream, &liveness, in_tx, out_rx).await;
            liveness.online.store(false, Ordering::Release);
            table.lock().remove(&id);
            drop(alive_tx);
            tracing::debug!(session = %id, %addr, "TCP connection closed");
        });
        session
    }

    /// Blocks for the next line from the client.
    ///
    /// Returns `Ok(None)` once the connection has closed and every buffered
    /// line has been read.
    ///
    /// # Errors
    /// [`NetError::Timeout`] if no line arrives within `timeout`.
    pub fn recv_line(&self, timeout: Duration) -> Result<Option<String>, NetError> {
        match recv_within(&self.inbound, timeout) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Err(NetError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Queues one line for the client. The newline is appended.
    ///
    /// # Errors
    /// [`NetError::ConnectionClosed`] if the connection task has ended.
    pub fn send_line(&self, line: &str) -> Result<(), NetError> {
        self.outbound
            .send(Outbound::Line(line.to_string()))
            .map_err(|_| NetError::ConnectionClosed(self.addr))
    }
}

impl Session for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn last_active(&self) -> Instant {
        *self.liveness.last_active.lock()
    }

    fn is_online(&self) -> bool {
        self.liveness.online.load(Ordering::Acquire)
    }

    fn kick(&self, reason: &str) {
        tracing::debug!(session = %self.id, reason, "kicking");
        let _ = self.outbound.send(Outbound::Line(format!("KICK {reason}")));
        let _ = self.outbound.send(Outbound::Close);
    }

    fn wait_for_disconnect(&self, timeout: Duration) -> bool {
        match recv_within(&self.finished, timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => !self.is_online(),
        }
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// `recv_timeout` that treats a timeout too large to add to the current
/// instant as no timeout at all.
fn recv_within<T>(rx: &flume::Receiver<T>, wait: Duration) -> Result<T, RecvTimeoutError> {
    match Instant::now().checked_add(wait) {
        Some(deadline) => rx.recv_deadline(deadline),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    }
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("online", &self.is_online())
            .finish()
    }
}

/// Moves lines between the socket and the session's channels until either
/// side closes. The first line may be at most [`LOGIN_LINE_LEN`] bytes and
/// later ones [`MAX_LINE_LEN`]; an overlong line drops the connection.
async fn drive(
    stream: TcpStream,
    liveness: &Liveness,
    inbound: flume::Sender<String>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    let mut cap = LOGIN_LINE_LEN;
    loop {
        // One byte past the cap, so an overlong line is detectable.
        let budget = (cap + 1).saturating_sub(buf.len()) as u64;
        let mut limited = (&mut reader).take(budget);
        tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        let _ = inbound.send(take_line(&mut buf));
                    }
                    break;
                }
                Ok(_) if buf.last() == Some(&b'\n') => {
                    *liveness.last_active.lock() = Instant::now();
                    // The session may have been dropped; keep draining.
                    let _ = inbound.send(take_line(&mut buf));
                    cap = MAX_LINE_LEN;
                }
                Ok(_) if buf.len() > cap => {
                    tracing::debug!(limit = cap, "line too long, dropping connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "read failed");
                    break;
                }
            },
            message = outbound.recv() => match message {
                Some(Outbound::Line(mut text)) => {
                    text.push('\n');
                    if let Err(e) = write.write_all(text.as_bytes()).await {
                        tracing::debug!(error = %e, "write failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.shutdown().await;
                    break;
                }
            },
        }
    }
}

/// Empties `buf` into a string without its line terminator.
fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
