//! TCP listeners and the accept loop.
//!
//! The server binds one listener per address family: a v6-only socket and a
//! separate IPv4 socket, so the two never fight over the port through
//! v4-mapped addresses. The accept loop waits on all listeners and the stop
//! token at once and spawns a connection handler per accepted socket.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::handler::handle_connection;
use crate::state::ChatState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no listen address configured")]
    NoListeners,
    #[error("failed to create socket for {addr}: {source}")]
    Socket { addr: SocketAddr, source: io::Error },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },
}

/// A bound, not yet running chat server.
pub struct Server {
    state: ChatState,
    listeners: Vec<TcpListener>,
}

impl Server {
    /// Bind every configured listener. Any failure is fatal and reported with
    /// the address it happened on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addrs = config.listen_addrs();
        if addrs.is_empty() {
            return Err(ServerError::NoListeners);
        }
        let listeners = addrs
            .into_iter()
            .map(|addr| bind_listener(addr, config.backlog))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            state: ChatState::new(config),
            listeners,
        })
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accept connections until `stop` is cancelled.
    pub async fn run(self, stop: CancellationToken) {
        serve(self.state, self.listeners, stop).await
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|source| ServerError::Socket { addr, source })?;

    let configure = || -> io::Result<()> {
        socket.set_reuseaddr(true)?;
        if addr.is_ipv6() {
            set_only_v6(&socket)?;
        }
        Ok(())
    };
    configure().map_err(|source| ServerError::Socket { addr, source })?;

    socket
        .bind(addr)
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| ServerError::Listen { addr, source })
}

/// Restrict an IPv6 socket to IPv6 traffic (`IPV6_V6ONLY`).
#[cfg(unix)]
fn set_only_v6(socket: &TcpSocket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_only_v6(_socket: &TcpSocket) -> io::Result<()> {
    Ok(())
}

/// Run the accept loop over `listeners` until `stop` is cancelled.
///
/// Each accepted connection gets its own task on `state.tracker`. Accept
/// errors are logged and the loop keeps going. On stop the listeners are
/// closed and the tracker is closed, but running handlers are left alone to
/// finish on their own.
pub async fn serve(state: ChatState, listeners: Vec<TcpListener>, stop: CancellationToken) {
    for listener in &listeners {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, max_users = state.registry.capacity(), "listening");
        }
    }

    let mut incoming = futures::stream::select_all(listeners.into_iter().map(TcpListenerStream::new));

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::debug!("accept loop received stop signal");
                break;
            }
            next = incoming.next() => match next {
                Some(Ok(stream)) => {
                    let peer = stream.peer_addr().ok();
                    match peer {
                        Some(addr) => tracing::info!(ip = %addr.ip(), port = addr.port(), "accepted connection"),
                        None => tracing::info!("accepted connection from unknown peer"),
                    }
                    state.tracker.spawn(handle_connection(stream, peer, state.clone()));
                }
                Some(Err(e)) => {
                    tracing::error!(?e, "failed to accept connection");
                    // Backoff to prevent tight loop under sustained accept errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                None => {
                    tracing::warn!("all listeners closed");
                    break;
                }
            },
        }
    }

    drop(incoming);
    state.tracker.close();
    tracing::info!(
        active = state.registry.len(),
        "stopped accepting connections"
    );
}
