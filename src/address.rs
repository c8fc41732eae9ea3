
use std::fmt;
use std::net;

/// The address of a remote endpoint: a 128-bit host address, a port, and an
/// IPv6 scope id. IPv4 addresses are represented in their IPv4-mapped form
/// (`::ffff:a.b.c.d`) so that a single socket serves both families.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    host: net::Ipv6Addr,
    port: u16,
    scope_id: u32,
}

impl Address {
    /// Creates an address with a zero scope id.
    pub fn new(host: net::Ipv6Addr, port: u16) -> Self {
        Self {
            host,
            port,
            scope_id: 0,
        }
    }

    /// Creates an address with an explicit IPv6 scope id.
    pub fn with_scope_id(host: net::Ipv6Addr, port: u16, scope_id: u32) -> Self {
        Self {
            host,
            port,
            scope_id,
        }
    }

    /// Returns the loopback address (`[::1]`) with the given port.
    pub fn localhost(port: u16) -> Self {
        Self::new(net::Ipv6Addr::LOCALHOST, port)
    }

    /// The 128-bit host address.
    pub fn host(&self) -> net::Ipv6Addr {
        self.host
    }

    /// The port, in host byte order.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The IPv6 scope id.
    pub fn scope_id(&self) -> u32 {
        self.scope_id
    }

    /// Returns `true` if the host is an IPv4-mapped IPv6 address.
    pub fn is_ipv4_mapped(&self) -> bool {
        let octets = self.host.octets();
        octets[..10].iter().all(|&x| x == 0) && octets[10] == 0xFF && octets[11] == 0xFF
    }

    pub(crate) fn to_socket_addr(self) -> net::SocketAddr {
        net::SocketAddr::V6(net::SocketAddrV6::new(self.host, self.port, 0, self.scope_id))
    }
}

impl From<net::SocketAddr> for Address {
    fn from(addr: net::SocketAddr) -> Self {
        match addr {
            net::SocketAddr::V4(v4) => Self::new(v4.ip().to_ipv6_mapped(), v4.port()),
            net::SocketAddr::V6(v6) => Self::with_scope_id(*v6.ip(), v6.port(), v6.scope_id()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]:{}", self.host, self.port)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_mapping() {
        let v4: net::SocketAddr = "127.0.0.1:8888".parse().unwrap();
        let address = Address::from(v4);

        assert!(address.is_ipv4_mapped());
        assert_eq!(address.port(), 8888);
        assert_eq!(address.host().to_string(), "::ffff:127.0.0.1");
    }

    #[test]
    fn test_ipv6_round_trip() {
        let v6: net::SocketAddr = "[::1]:7777".parse().unwrap();
        let address = Address::from(v6);

        assert!(!address.is_ipv4_mapped());
        assert_eq!(address.to_socket_addr(), v6);
    }
}
