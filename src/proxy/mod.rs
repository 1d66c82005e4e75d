//! SOCKS acceptor
//!
//! Runs once on a freshly accepted client socket, before any relaying, and
//! yields the server-side socket the connection will relay to:
//! - SOCKS4 CONNECT (RFC-less de facto protocol)
//! - SOCKS5 CONNECT without authentication (RFC 1928)

mod socks;

pub use socks::{accept, Handshake, SocksVersion};

use thiserror::Error;

/// SOCKS handshake failures
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("SOCKSv{0} is not supported")]
    InvalidSocksVersion(u8),

    #[error("SOCKSv{version}: unknown command {command}")]
    UnsupportedCommand { version: u8, command: u8 },

    #[error("SOCKSv5: unknown address type {0}")]
    UnsupportedAddressType(u8),

    #[error("SOCKSv5: no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("SOCKSv{version}: invalid address: {reason}")]
    InvalidAddress { version: u8, reason: String },

    #[error("SOCKSv{version}: cannot reach {target}: {reason}")]
    TargetUnreachable {
        version: u8,
        target: String,
        reason: String,
    },
}
