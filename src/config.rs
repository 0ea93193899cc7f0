//! Gateway configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Port the JIP device network listens on. The IPv4 side defaults to the
/// same number but is configurable.
pub const JIP_PORT: u16 = 1873;

/// A mapping with no traffic in either direction for this long is evicted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Upper bound on every readiness wait, so eviction sweeps run even when
/// the network is quiet.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Config {
    /// IPv4 address to listen on for both tunnels.
    pub listen_addr: IpAddr,
    /// IPv4 listen port for both tunnels.
    pub listen_port: u16,
    /// Destination port on the IPv6 device network. Not exposed on the CLI;
    /// overridden only by tests targeting ephemeral loopback sockets.
    pub jip_port: u16,
    /// Preferred multicast egress interface. Its absence on the host is a
    /// reduced-scope fallback, not an error.
    pub tunnel_interface: String,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Cap on concurrent TCP sessions; connections beyond it are refused.
    pub max_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: JIP_PORT,
            jip_port: JIP_PORT,
            tunnel_interface: "tun0".to_string(),
            idle_timeout: IDLE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            max_sessions: 64,
        }
    }
}

impl Config {
    pub fn listen_socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.listen_addr, self.listen_port)
    }
}
