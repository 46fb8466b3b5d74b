use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::registry::ClientRegistry;

/// Everything a connection handler needs, shared by the acceptor and every
/// handler of one server instance.
#[derive(Clone)]
pub struct ChatState {
    pub registry: ClientRegistry,
    pub broadcaster: Broadcaster,
    pub config: Arc<ServerConfig>,
    /// Cancelling this disconnects every session.
    pub disconnect_all: CancellationToken,
    /// Tracks connection handler tasks so shutdown can wait for them.
    pub tracker: TaskTracker,
}

impl ChatState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = ClientRegistry::with_capacity(config.max_users);
        let broadcaster =
            Broadcaster::with_failure_threshold(registry.clone(), config.write_failure_threshold);
        Self {
            registry,
            broadcaster,
            config: Arc::new(config),
            disconnect_all: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}
