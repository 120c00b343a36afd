//! Backend endpoints and endpoint sets.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A reachable backend `(address, port)` pair.
///
/// Equality is exact on both fields; the same address on two ports is two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Backend IP address.
    pub address: IpAddr,
    /// Backend port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    #[must_use]
    pub const fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// The endpoint as a socket address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| Error::invalid_endpoint(s))
    }
}

/// A set of endpoints. Ordered so logs and journals are deterministic.
pub type EndpointSet = BTreeSet<Endpoint>;

/// Render a set as `{a b c}` for log lines.
#[must_use]
pub fn display_set(set: &EndpointSet) -> String {
    format!("{{{}}}", set.iter().join(" "))
}
