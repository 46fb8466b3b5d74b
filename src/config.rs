use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use crate::broadcast::DEFAULT_WRITE_FAILURE_THRESHOLD;
use crate::framing::Framing;
use crate::registry::DEFAULT_MAX_USERS;

/// TCP port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 7270;

/// Runtime settings for the chat server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// IPv4 listen address; `None` disables the IPv4 listener.
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 listen address; `None` disables the IPv6 listener. The socket is
    /// always v6-only so it never competes with the IPv4 listener.
    pub ipv6: Option<Ipv6Addr>,
    pub backlog: u32,
    /// Maximum number of registered clients.
    pub max_users: usize,
    pub framing: Framing,
    /// How long a fresh connection may take to send its display name.
    pub name_timeout: Duration,
    /// Consecutive failed deliveries before a client is disconnected.
    /// `0` never disconnects.
    pub write_failure_threshold: usize,
    /// Broadcast "Client <name> has disconnected." when someone leaves.
    pub announce_departures: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ipv4: Some(Ipv4Addr::UNSPECIFIED),
            ipv6: Some(Ipv6Addr::UNSPECIFIED),
            backlog: 128,
            max_users: DEFAULT_MAX_USERS,
            framing: Framing::default(),
            name_timeout: Duration::from_secs(30),
            write_failure_threshold: DEFAULT_WRITE_FAILURE_THRESHOLD,
            announce_departures: true,
        }
    }
}

impl ServerConfig {
    /// A config listening only on 127.0.0.1 with an OS-assigned port.
    pub fn loopback() -> Self {
        Self {
            port: 0,
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            ..Self::default()
        }
    }

    /// Socket addresses to bind, IPv6 first.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::with_capacity(2);
        if let Some(ip) = self.ipv6 {
            addrs.push(SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, 0)));
        }
        if let Some(ip) = self.ipv4 {
            addrs.push(SocketAddr::V4(SocketAddrV4::new(ip, self.port)));
        }
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_both_families() {
        let config = ServerConfig::default();
        let addrs = config.listen_addrs();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv6());
        assert!(addrs[1].is_ipv4());
        assert!(addrs.iter().all(|a| a.port() == DEFAULT_PORT));
    }

    #[test]
    fn loopback_is_ipv4_only() {
        let addrs = ServerConfig::loopback().listen_addrs();
        assert_eq!(addrs, vec!["127.0.0.1:0".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn disabling_both_families_leaves_nothing() {
        let config = ServerConfig {
            ipv4: None,
            ipv6: None,
            ..ServerConfig::default()
        };
        assert!(config.listen_addrs().is_empty());
    }
}
