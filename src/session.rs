use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::registry::ClientRegistry;

/// Maximum length of a display name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Payloads that may wait in a session's outbox before deliveries to it
/// start failing.
pub const OUTBOX_CAPACITY: usize = 128;

/// How long [`Session::close`] lets the outbox drain before dropping what is
/// left.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Write half of a client connection, type-erased so sessions can wrap TCP
/// sockets, in-memory duplex pipes, or test doubles alike.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Validate a display name. Names must be 1-64 bytes with no control characters.
pub fn validate_display_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("display name must not be empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "display name too long ({} bytes, max {MAX_NAME_LEN})",
            name.len()
        ));
    }
    if name.chars().any(char::is_control) {
        return Err("display name contains control characters".into());
    }
    Ok(())
}

/// Opaque identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Disconnected,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Registered,
            _ => Self::Disconnected,
        }
    }
}

/// Server-side state for one named client.
///
/// Cloning a `Session` is cheap; all clones share the same outbox and
/// lifecycle flags. The connection handler that created a session owns its
/// lifetime: the registry and the broadcast engine only ever hold clones.
///
/// Outbound bytes never go to the socket directly. [`Session::send`] queues
/// them on a bounded outbox that a per-session writer task drains in order,
/// so a client that stops reading stalls only its own writer task.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    name: String,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    /// `None` once the session has been closed.
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    /// Consecutive failed deliveries, reset on the next successful one.
    write_failures: AtomicUsize,
    /// Fires when something other than the owning handler wants the
    /// session gone (write-failure threshold, write error, forced shutdown).
    /// The writer task stops writing as soon as it fires.
    close_requested: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in the `Connecting` state and start its writer task.
    /// It becomes `Registered` only when [`ClientRegistry::register`]
    /// accepts it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, peer: Option<SocketAddr>, writer: BoxedWriter) -> Self {
        let id = SessionId::new();
        let close_requested = CancellationToken::new();
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let writer_task = tokio::spawn(drain_outbox(id, writer, rx, close_requested.clone()));
        Self {
            inner: Arc::new(SessionInner {
                id,
                name: name.into(),
                peer,
                state: AtomicU8::new(SessionState::Connecting as u8),
                outbox: Mutex::new(Some(tx)),
                writer_task: Mutex::new(Some(writer_task)),
                write_failures: AtomicUsize::new(0),
                close_requested,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    /// Promote `Connecting` to `Registered`. Fails if the session was closed
    /// (or registered) in the meantime. Called by the registry under its lock.
    pub(crate) fn mark_registered(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Registered as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Queue the whole payload for this client without waiting on the socket.
    ///
    /// Payloads are written in the order they were queued, each one in full
    /// before the next, so concurrent senders never interleave. Fails with
    /// `WouldBlock` when the outbox is full and `NotConnected` once the
    /// session is closed or closing.
    pub fn send(&self, payload: impl Into<Bytes>) -> io::Result<()> {
        if self.is_close_requested() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session is closing"));
        }
        let outbox = self.inner.outbox.lock();
        let tx = outbox
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session is closed"))?;
        tx.try_send(payload.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "outbox is full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::NotConnected, "writer has stopped")
            }
        })
    }

    /// Record one failed delivery and return the new consecutive count.
    pub fn record_write_failure(&self) -> usize {
        self.inner.write_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_write_failures(&self) {
        self.inner.write_failures.store(0, Ordering::Release);
    }

    pub fn write_failures(&self) -> usize {
        self.inner.write_failures.load(Ordering::Acquire)
    }

    /// Ask the owning connection handler to close this session.
    ///
    /// Pending writes are abandoned at once. The registry is left alone; the
    /// handler observes the request through [`Session::close_requested`] and
    /// runs [`Session::close`].
    pub fn request_close(&self) {
        self.inner.close_requested.cancel();
    }

    pub fn is_close_requested(&self) -> bool {
        self.inner.close_requested.is_cancelled()
    }

    /// Resolves once [`Session::request_close`] has been called.
    pub fn close_requested(&self) -> WaitForCancellationFuture<'_> {
        self.inner.close_requested.cancelled()
    }

    /// Transition to `Disconnected`, leave the registry, and shut the
    /// writer down.
    ///
    /// Whatever is still queued gets up to [`DRAIN_TIMEOUT`] to reach the
    /// client, or none at all if a close was already requested.
    ///
    /// Only the first call does anything and returns `true`; every later or
    /// concurrent call returns `false`. The caller that gets `true` owns any
    /// follow-up such as the departure notice.
    pub async fn close(&self, registry: &ClientRegistry) -> bool {
        let previous = self
            .inner
            .state
            .swap(SessionState::Disconnected as u8, Ordering::AcqRel);
        if SessionState::from_u8(previous) == SessionState::Disconnected {
            return false;
        }

        registry.unregister(self.id());

        // Dropping the sender lets the writer task finish the queue and exit
        drop(self.inner.outbox.lock().take());
        let writer_task = self.inner.writer_task.lock().take();
        if let Some(mut writer_task) = writer_task {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
                tracing::debug!(session = %self.inner.id, "outbox did not drain, dropping the rest");
                self.inner.close_requested.cancel();
                let _ = writer_task.await;
            }
        }
        self.inner.close_requested.cancel();
        true
    }
}

/// Writer task: copy queued payloads to the socket until the outbox closes
/// or a close is requested, then shut the socket's write side down.
async fn drain_outbox(
    id: SessionId,
    mut writer: BoxedWriter,
    mut outbox: mpsc::Receiver<Bytes>,
    abort: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            next = outbox.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        // write_all keeps going through partial writes
        let write = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            result = write => result,
        };
        if let Err(e) = result {
            tracing::debug!(session = %id, ?e, "write failed, requesting close");
            abort.cancel();
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(session = %id, ?e, "writer shutdown failed");
    }
}
