//! Host/port resolution and address helpers.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
};

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IPv4 => write!(f, "IPv4"),
            Self::IPv6 => write!(f, "IPv6"),
        }
    }
}

/// Resolves a host string and port into a socket address.
///
/// Implementations must be stateless with respect to callers: they are
/// invoked from arbitrary threads and queues.
pub trait AddressResolver: Send + Sync {
    /// Returns `None` when `host` can neither be parsed nor looked up.
    fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr>;
}

/// Default resolver. Literal addresses are parsed directly, anything else
/// goes through the system resolver and the first result wins. An empty host
/// yields the IPv4 wildcard address.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr> {
        if host.is_empty() {
            return Some(wildcard(AddressFamily::IPv4, port));
        }

        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, port));
        }

        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(err) => {
                log::debug!(target:"tcp_socket", "resolve {}:{} failed, {}", host, port, err);
                None
            }
        }
    }
}

/// Wildcard bind address for `family`.
pub fn wildcard(family: AddressFamily, port: u16) -> SocketAddr {
    match family {
        AddressFamily::IPv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        AddressFamily::IPv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

pub fn classify(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::IPv4,
        SocketAddr::V6(_) => AddressFamily::IPv6,
    }
}

/// Human readable `host:port`, IPv6 hosts in brackets.
pub fn render(addr: &SocketAddr) -> String {
    addr.to_string()
}
