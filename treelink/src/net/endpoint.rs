//! Network endpoint types.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

/// Default multicast group discovery probes are sent to.
pub const DEFAULT_DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 1);

/// Default UDP port discovery servers listen on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7770;

/// A network endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`] so the rest of the crate deals in one
/// address type whether it came from a discovery reply, a config file or a
/// connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// All interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// The default discovery multicast destination.
    #[must_use]
    pub const fn discovery_group() -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            DEFAULT_DISCOVERY_GROUP,
            DEFAULT_DISCOVERY_PORT,
        )))
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Same address, different port.
    #[must_use]
    pub const fn with_port(&self, port: u16) -> Self {
        Self(SocketAddr::new(self.0.ip(), port))
    }

    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0.ip().is_multicast()
    }

    /// An address a TCP connect can target (not unspecified, not multicast).
    #[must_use]
    pub fn is_connectable(&self) -> bool {
        let ip = self.0.ip();
        !ip.is_unspecified() && !ip.is_multicast() && self.0.port() != 0
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self(SocketAddr::V4(addr))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_new_v4() {
        let ep = Endpoint::new_v4(192, 168, 1, 100, 8080);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn discovery_group_is_multicast() {
        let ep = Endpoint::discovery_group();
        assert!(ep.is_multicast());
        assert!(!ep.is_connectable());
        assert_eq!(ep.port(), DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn connectable_rules() {
        assert!(Endpoint::localhost(80).is_connectable());
        assert!(!Endpoint::localhost(0).is_connectable());
        assert!(!Endpoint::any(80).is_connectable());
        assert_eq!(Endpoint::localhost(1).with_port(9).port(), 9);
    }

    #[test]
    fn endpoint_display() {
        let ep = Endpoint::new_v4(127, 0, 0, 1, 8080);
        assert_eq!(format!("{ep}"), "127.0.0.1:8080");
    }
}
