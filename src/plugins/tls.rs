//! SSL/TLS record dissector (without decryption)

use crate::protocol::{Capabilities, Plugin, PluginOptions, Protocol, Reader};
use crate::Result;

pub const PLUGIN: Plugin = Plugin {
    name: "tls",
    description: "SSL/TLS sniffer",
    version: 1,
    capabilities: Capabilities::STREAM,
    factory: create,
};

fn create(_options: &PluginOptions) -> Result<Box<dyn Protocol>> {
    Ok(Box::new(Tls))
}

const RECORD_TYPES: &[(u8, &str)] = &[
    (0, "HELLO_REQUEST"),
    (1, "CLIENT_HELLO"),
    (2, "SERVER_HELLO"),
    (11, "CERTIFICATE"),
    (12, "SERVER_KEY_EXCHANGE"),
    (13, "CERTIFICATE_REQUEST"),
    (14, "SERVER_HELLO_DONE"),
    (15, "CERTIFICATE_VERIFY"),
    (16, "CLIENT_KEY_EXCHANGE"),
    (20, "CHANGE_CIPHER_SPEC"),
    (21, "ALERT"),
    (22, "HANDSHAKE"),
    (23, "APPLICATION_DATA"),
    (32, "FINISHED"),
    (33, "CERTIFICATE_URL"),
    (34, "CERTIFICATE_STATUS"),
];

fn record_type(kind: u8) -> Option<&'static str> {
    RECORD_TYPES
        .iter()
        .find(|(code, _)| *code == kind)
        .map(|(_, name)| *name)
}

pub struct Tls;

impl Protocol for Tls {
    fn dump(&self, _incoming: bool, input: &mut dyn Reader) -> Result<String> {
        let kind = input.read_u8()?;
        let major = input.read_u8()?;
        let minor = input.read_u8()?;
        let length = input.read_u16_be()?;
        input.read_bytes(length as usize)?;

        let name = match record_type(kind) {
            Some(name) => name.to_string(),
            None => format!("UNKNOWN ({})", kind),
        };
        Ok(format!("{} [{}.{}], {} bytes", name, major, minor, length))
    }
}
