//! Network endpoint types and name resolution.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use crate::trace::warn;

/// A network endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`]; an owned value with no native resources
/// attached, so it can be copied into datagrams and the registration table freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a new IPv4 endpoint.
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// Creates an endpoint bound to all interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Wildcard endpoint of the same address family, port 0.
    ///
    /// Client sockets bind here so the OS picks the local address on first send.
    #[must_use]
    pub const fn unspecified_like(&self) -> Self {
        match self.0 {
            SocketAddr::V4(_) => Self::any(0),
            SocketAddr::V6(_) => Self::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    /// Returns the IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns `true` for IPv6 endpoints.
    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
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

/// Error resolving a host name into an [`Endpoint`].
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The system resolver failed.
    #[error("failed to resolve {host}:{port}: {source}")]
    Lookup {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// The resolver succeeded but returned no address.
    #[error("no address found for {host}:{port}")]
    NoAddress { host: String, port: u16 },
}

/// Resolves `host:port` to the first address reported by the system resolver.
///
/// `host` may be a literal IPv4/IPv6 address or a name.
///
/// # Errors
///
/// Returns [`ResolveError`] if the lookup fails or yields nothing.
pub fn resolve(host: &str, port: u16) -> Result<Endpoint, ResolveError> {
    let mut addrs = (host, port).to_socket_addrs().map_err(|source| {
        warn!(host, port, error = %source, "address resolution failed");
        ResolveError::Lookup {
            host: host.to_owned(),
            port,
            source,
        }
    })?;

    addrs.next().map(Endpoint::from).ok_or_else(|| ResolveError::NoAddress {
        host: host.to_owned(),
        port,
    })
}
