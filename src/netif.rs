//! Outbound interface selection.
//!
//! Multicast setup needs the IPv4 address of the interface that should carry
//! group traffic. The engine takes this as an injectable helper with a single
//! contract: return the address of a multicast-capable interface, or loopback
//! when none can be determined. The default implementation probes the routing
//! table by connecting a throwaway UDP socket toward the group — connect on a
//! datagram socket performs the route lookup without sending anything — and
//! reading back which local address the kernel picked.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use crate::protocol::{MULTICAST_GROUP, MULTICAST_PORT};

/// Address of the interface holding the default multicast route, or
/// loopback when the probe fails.
pub fn default_interface() -> Ipv4Addr {
    probe_route().unwrap_or(Ipv4Addr::LOCALHOST)
}

fn probe_route() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket
        .connect(SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT))
        .ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(local) if !local.ip().is_unspecified() => Some(*local.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_interface_always_yields_an_address() {
        // whatever the environment, the fallback guarantees an answer.
        let addr = default_interface();
        assert!(!addr.is_unspecified());
    }
}
