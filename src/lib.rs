//! chatd - a small TCP chat relay.
//!
//! Clients connect, register a unique display name, and every message they
//! send is relayed to all other registered clients as `[name]: message`.

pub mod broadcast;
pub mod client;
pub mod command;
pub mod config;
pub mod framing;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::ServerConfig;
pub use registry::{ClientRegistry, RegistryError, RegistryEvent};
pub use server::{Server, ServerError};
pub use session::{Session, SessionId, SessionState};
pub use state::ChatState;
