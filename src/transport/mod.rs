//! Transport helpers
//!
//! Provides:
//! - `HostAddress` and IPv4 resolution
//! - TCP listen/connect with the proxy's socket options
//! - a readiness wait over many descriptors plus a `Waker` to interrupt it

mod poll;
mod tcp;

pub use poll::{poll_readable, Waker};
pub use tcp::{connect, listen_at};

use crate::{Error, Result};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Host name (or literal IPv4 address) and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// First IPv4 address the host resolves to
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::HostUnreachable(self.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::HostUnreachable(self.to_string()))
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAddress {
    type Err = Error;

    /// Parse `HOST:PORT`; the port must be non-zero.
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("invalid HOST:PORT argument: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid remote port number: {}", port)))?;
        if port == 0 {
            return Err(Error::Config("invalid remote port number: 0".to_string()));
        }
        if host.is_empty() {
            return Err(Error::Config(format!("missing host in {}", s)));
        }
        Ok(Self::new(host, port))
    }
}
