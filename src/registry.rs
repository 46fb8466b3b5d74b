use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast as tokio_broadcast;

use crate::session::{validate_display_name, Session, SessionId};

/// Default number of clients allowed to be registered at once.
pub const DEFAULT_MAX_USERS: usize = 20;

/// Registry membership events.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Joined { id: SessionId, name: String },
    Left { id: SessionId, name: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("display name already taken: {0}")]
    NameExists(String),
    #[error("registry is full ({capacity} users)")]
    RegistryFull { capacity: usize },
    #[error("invalid display name: {0}")]
    InvalidName(String),
    #[error("session is already registered or closed")]
    SessionUnavailable,
}

struct RegistryInner {
    /// Members in registration order.
    sessions: Vec<Session>,
    capacity: usize,
}

/// The set of clients currently online.
///
/// Every operation takes the same mutex for the length of its scan or
/// mutation and never across an `.await`, so readers never see a half
/// updated table and broadcast I/O never runs under the lock.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    events_tx: tokio_broadcast::Sender<RegistryEvent>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_USERS)
    }

    /// Create an empty registry admitting at most `capacity` members.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events_tx, _) = tokio_broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: Vec::with_capacity(capacity),
                capacity,
            })),
            events_tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Add a session under its display name.
    ///
    /// Name validation, the capacity check, the uniqueness scan and the
    /// insert all happen under one lock acquisition, so two concurrent
    /// registrations of the same name cannot both succeed. A rejected
    /// registration leaves the table untouched.
    pub fn register(&self, session: &Session) -> Result<(), RegistryError> {
        validate_display_name(session.name()).map_err(RegistryError::InvalidName)?;

        let mut inner = self.inner.lock();

        if inner.sessions.len() >= inner.capacity {
            return Err(RegistryError::RegistryFull {
                capacity: inner.capacity,
            });
        }
        if inner.sessions.iter().any(|s| s.id() == session.id()) {
            return Err(RegistryError::SessionUnavailable);
        }
        if inner.sessions.iter().any(|s| s.name() == session.name()) {
            return Err(RegistryError::NameExists(session.name().to_string()));
        }
        // A session closed before it got here must never enter the table.
        if !session.mark_registered() {
            return Err(RegistryError::SessionUnavailable);
        }

        inner.sessions.push(session.clone());

        // Send event (ignore error if there are no receivers).
        let _ = self.events_tx.send(RegistryEvent::Joined {
            id: session.id(),
            name: session.name().to_string(),
        });
        Ok(())
    }

    /// Remove the session with this id. Idempotent: returns `None` if it is
    /// not (or no longer) a member.
    pub fn unregister(&self, id: SessionId) -> Option<Session> {
        let mut inner = self.inner.lock();
        let index = inner.sessions.iter().position(|s| s.id() == id)?;
        let removed = inner.sessions.remove(index);
        let _ = self.events_tx.send(RegistryEvent::Left {
            id,
            name: removed.name().to_string(),
        });
        Some(removed)
    }

    /// Point-in-time copy of every member except `exclude`, in registration
    /// order. The lock is released before this returns, so callers are free
    /// to do slow network writes to the result.
    pub fn snapshot_for_broadcast(&self, exclude: SessionId) -> Vec<Session> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|s| s.id() != exclude)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        let inner = self.inner.lock();
        inner.sessions.iter().find(|s| s.id() == id).cloned()
    }

    /// Case-sensitive exact lookup by display name.
    pub fn find_by_name(&self, name: &str) -> Option<Session> {
        let inner = self.inner.lock();
        inner.sessions.iter().find(|s| s.name() == name).cloned()
    }

    /// Display names of all members, in registration order.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner.sessions.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to join/leave events.
    pub fn subscribe_events(&self) -> tokio_broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }
}
