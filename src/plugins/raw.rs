//! Universal raw dissector

use crate::protocol::{Capabilities, Plugin, PluginOptions, Protocol, Reader};
use crate::{Result, CHUNK_SIZE};

pub const PLUGIN: Plugin = Plugin {
    name: "raw",
    description: "Universal raw sniffer",
    version: 1,
    capabilities: Capabilities::STREAM,
    factory: create,
};

fn create(_options: &PluginOptions) -> Result<Box<dyn Protocol>> {
    Ok(Box::new(Raw))
}

/// One message per batch of bytes that arrived together
pub struct Raw;

impl Protocol for Raw {
    fn dump(&self, _incoming: bool, input: &mut dyn Reader) -> Result<String> {
        let mut buf = [0u8; CHUNK_SIZE];
        match input.read(&mut buf)? {
            0 => Err(crate::Error::EndOfStream),
            1 => Ok("1 byte".to_string()),
            n => Ok(format!("{} bytes", n)),
        }
    }
}
