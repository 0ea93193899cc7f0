//! Upstream IPv6 socket factory.
//!
//! Every mapping and every TCP session owns one of these sockets for the
//! lifetime of the flow. The socket is bound to an ephemeral port so device
//! replies come straight back to the owning flow, and configured for
//! multicast egress into the device network.

use std::ffi::CString;
use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

/// Multicast packets need at least 2 hops: enough to cross the border
/// router from the local network.
const MULTICAST_HOPS: u32 = 2;

/// Creates an IPv6 UDP socket for sending to the device network.
///
/// Hop-limit and egress-interface failures are logged and tolerated; the
/// socket still works for unicast and link-local traffic.
pub fn upstream_socket(interface: &str) -> io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into())?;

    if let Err(e) = socket.set_multicast_hops_v6(MULTICAST_HOPS) {
        warn!("error setting multicast hop limit: {e}");
    }

    // No tunnel interface on this host is a reduced-scope fallback, not an
    // error: multicast stays on the default route.
    if let Some(index) = interface_index(interface) {
        if let Err(e) = socket.set_multicast_if_v6(index) {
            warn!("error setting multicast egress to {interface}: {e}");
        }
    }

    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(socket.into())
}

fn interface_index(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    (index > 0).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_ipv6_port() {
        let socket = upstream_socket("no-such-interface").unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.is_ipv6());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn each_socket_gets_its_own_port() {
        let a = upstream_socket("no-such-interface").unwrap();
        let b = upstream_socket("no-such-interface").unwrap();
        assert_ne!(a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
    }

    #[test]
    fn unknown_interface_has_no_index() {
        assert_eq!(interface_index("jipd-test-no-such-if"), None);
    }
}
