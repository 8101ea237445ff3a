//! Node configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Well-known discovery port shared by every node on the network.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5000;

/// Settings for one NetSync node.
#[derive(Debug, Clone)]
pub struct NetSyncConfig {
    /// UDP port the discovery socket binds. Bound with reuse-address so
    /// several processes on one host can share it and all hear the same
    /// broadcasts.
    pub discovery_port: u16,
    /// Where announcements are sent: limited broadcast on the discovery
    /// port by default, overridable so constrained networks and test
    /// harnesses can aim somewhere specific.
    pub announce_addr: SocketAddr,
    /// When set, the hosting process drives start/stop itself instead of
    /// the node starting at boot.
    pub manual_start: bool,
}

impl Default for NetSyncConfig {
    fn default() -> Self {
        Self::with_port(DEFAULT_DISCOVERY_PORT)
    }
}

impl NetSyncConfig {
    /// Default configuration listening and announcing on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            discovery_port: port,
            announce_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            manual_start: false,
        }
    }
}
