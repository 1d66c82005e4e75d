//! # Wiretap
//!
//! A transparent TCP interception proxy. Client connections are relayed
//! byte-for-byte to a server (either a fixed remote host or a destination
//! learned through a SOCKS4/SOCKS5 handshake) while a copy of each direction
//! is fed to a protocol dissector that logs individual application messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Sniffer (controller)                 │
//! │     accept loop · connection slots · poll thread      │
//! ├──────────────────────────────────────────────────────┤
//! │                     Connection                        │
//! │   client Channel ⇄ server Channel · 2 dump threads    │
//! ├──────────────────────────────────────────────────────┤
//! │                 Protocol plugins                      │
//! │            raw · tls · bubuta (Reader SDK)            │
//! ├──────────────────────────────────────────────────────┤
//! │                     Transport                         │
//! │         TCP sockets · poll(2) · SOCKS acceptor        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Only the poll thread ever reads from a socket. Bytes it reads are queued
//! for the dissector and immediately written to the opposite socket, so
//! relaying keeps working no matter what the dissector makes of them.

pub mod channel;
pub mod config;
pub mod connection;
pub mod output;
pub mod plugins;
pub mod protocol;
pub mod proxy;
pub mod sniffer;
pub mod transport;

pub use config::Config;
pub use protocol::{Protocol, Reader};
pub use sniffer::Sniffer;

use std::io;
use std::time::Duration;

/// Maximum number of bytes taken from a socket per readiness notification
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound for one readiness wait of the poll thread
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a relay write may stall before the receiving side is dropped
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen backlog of the accept socket
pub const LISTEN_BACKLOG: i32 = 50;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte source died before the requested bytes arrived.
    #[error("End of stream")]
    EndOfStream,

    #[error("{stage}: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(#[from] proxy::ProxyError),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Protocol with name «{0}» was not found")]
    PluginNotFound(String),

    #[error("Plugin {plugin} does not support {transport} connections")]
    UnsupportedTransport {
        plugin: &'static str,
        transport: protocol::Transport,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns a mapper that labels an I/O error with the failing stage.
    ///
    /// ```
    /// # use wiretap::Error;
    /// let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
    /// let err = Error::transport("connecting to host")(err);
    /// assert!(err.to_string().starts_with("connecting to host: "));
    /// ```
    pub fn transport(stage: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Transport { stage, source }
    }

    /// True for the expected end-of-stream termination signal.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    /// OS error code carried by a transport error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Transport { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
