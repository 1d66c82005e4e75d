//! Dissector plugin SDK
//!
//! Provides:
//! - `Reader`, the blocking byte source a dissector consumes
//! - `Protocol`, the per-connection dissector contract
//! - `PluginOptions`, the `key=value,...` plugin configuration
//! - the process-wide plugin `Registry`

mod registry;

pub use registry::{Plugin, Registry};

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Blocking byte source.
///
/// Wire values are always decoded with an explicit byte order; nothing here
/// depends on the host's endianness.
pub trait Reader {
    /// Read up to `buf.len()` bytes, blocking until at least one is available.
    ///
    /// Returns `Ok(0)` once the source has ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` completely or fail with [`Error::EndOfStream`].
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(Error::EndOfStream),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes into a new vector.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_fully(&mut buf)?;
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_fully(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_fully(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_fully(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_fully(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_fully(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_fully(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_fully(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// In-memory source; ends when the slice is exhausted.
impl Reader for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

impl<R: Reader + ?Sized> Reader for &mut R {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read_fully(buf)
    }
}

/// Protocol dissector, one instance per connection.
///
/// Both direction threads of a connection call `dump` on the same instance,
/// each with its own `input`. Per-connection decode state must live behind a
/// lock that is never held across a read from `input`.
pub trait Protocol: Send + Sync {
    /// Consume exactly one application message from `input` and render it.
    ///
    /// `incoming` is true for server-to-client traffic. Fails with
    /// [`Error::EndOfStream`] when the stream ends; malformed messages should
    /// be rendered as raw dumps rather than returned as errors.
    fn dump(&self, incoming: bool, input: &mut dyn Reader) -> Result<String>;
}

/// Transport kinds a plugin can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream => write!(f, "stream"),
            Transport::Datagram => write!(f, "datagram"),
        }
    }
}

/// Capability flags declared by a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const STREAM: Capabilities = Capabilities(1);
    pub const DATAGRAM: Capabilities = Capabilities(2);

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub fn supports(self, transport: Transport) -> bool {
        let flag = match transport {
            Transport::Stream => Self::STREAM,
            Transport::Datagram => Self::DATAGRAM,
        };
        self.0 & flag.0 != 0
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(Transport::Stream, "STREAM"), (Transport::Datagram, "DATAGRAM")]
            .iter()
            .filter(|(t, _)| self.supports(*t))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Read-only plugin options parsed from `key=value,key=value`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginOptions {
    options: BTreeMap<String, String>,
}

impl PluginOptions {
    /// Parse an option string.
    ///
    /// A key without `=` gets an empty value, empty keys are skipped and a
    /// repeated key keeps its last value.
    pub fn parse(text: &str) -> Self {
        let options = text
            .split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
            })
            .collect();
        Self { options }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
