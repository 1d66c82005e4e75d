//! Bubuta mobile chat protocol dissector
//!
//! ```text
//! length(4 BE) · checksum(1) · food group(1) · type(1) · flags(1) · payload(length - 4)
//! ```
//!
//! Flag bit 0 marks a gzip-compressed payload. Once a key has been
//! negotiated every frame on the connection is XORed with it, starting over
//! at the first key byte for each frame.

pub mod inflate;
pub mod keys;
pub mod value;

use crate::output::hex_dump;
use crate::protocol::{Capabilities, Plugin, PluginOptions, Protocol, Reader};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt::Write as _;
use tracing::debug;

pub const PLUGIN: Plugin = Plugin {
    name: "bubuta",
    description: "Bubuta chat protocol sniffer",
    version: 1,
    capabilities: Capabilities::STREAM,
    factory: create,
};

/// Smallest valid frame length (the header bytes it covers)
const MIN_FRAME_LENGTH: u32 = 4;

/// Frame lengths from here on are treated as a desynchronized stream
pub const MAX_FRAME_LENGTH: u32 = 0x40000;

const FLAG_COMPRESSED: u8 = 0x01;

/// Food group of the key exchange messages
const FOOD_GROUP_CONTROL: u8 = 0;

fn create(options: &PluginOptions) -> Result<Box<dyn Protocol>> {
    let key = match options.get("key") {
        Some(hex_key) => hex::decode(hex_key)
            .map_err(|e| Error::Config(format!("bubuta: invalid key option: {}", e)))?,
        None => Vec::new(),
    };
    Ok(Box::new(Bubuta::with_key(key)))
}

/// Per-connection dissector; the key is shared by both directions.
#[derive(Default)]
pub struct Bubuta {
    key: Mutex<Vec<u8>>,
}

impl Bubuta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            key: Mutex::new(key),
        }
    }

    pub fn key(&self) -> Vec<u8> {
        self.key.lock().clone()
    }

    fn exchange_key(&self, kind: u8, payload: &[u8]) {
        if let Some(key) = keys::negotiated_key(kind, payload) {
            debug!("Bubuta: new key {}", hex::encode(&key));
            *self.key.lock() = key;
        }
    }
}

impl Protocol for Bubuta {
    fn dump(&self, _incoming: bool, input: &mut dyn Reader) -> Result<String> {
        let mut input = KeyedReader::new(input, &self.key);

        let length = input.read_u32_be()?;
        // Checksum algorithm unknown; read and ignored
        let _checksum = input.read_u8()?;
        if !(MIN_FRAME_LENGTH..MAX_FRAME_LENGTH).contains(&length) {
            return Ok("\nBad frame length.\n".to_string());
        }

        let food_group = input.read_u8()?;
        let kind = input.read_u8()?;
        let flags = input.read_u8()?;
        let mut payload = input.read_bytes((length - MIN_FRAME_LENGTH) as usize)?;
        let keyed = input.is_keyed();

        let mut out = format!("--[{}/{}", food_group, kind);
        if flags != 0 {
            let _ = write!(out, ", flags={:x}", flags);
        }
        out.push_str("]--\n");

        let compressed = flags & FLAG_COMPRESSED != 0;
        let inflated = if compressed {
            inflate::gunzip(&payload).map(Some)
        } else {
            Ok(None)
        };

        match inflated {
            Err(e) => {
                debug!("Bubuta: {}", e);
                out.push_str("\n[!] Could not uncompress packet. Raw dump:\n");
                out.push_str(&hex_dump(&payload));
            }
            Ok(inflated) => {
                if let Some(inflated) = inflated {
                    payload = inflated;
                }
                render(&payload, compressed || keyed, &mut out);
            }
        }

        if food_group == FOOD_GROUP_CONTROL {
            self.exchange_key(kind, &payload);
        }
        Ok(out)
    }
}

/// Append the decoded payload, or a raw dump if it does not decode.
///
/// `transformed` payloads differ from the wire bytes the log dumps, so
/// their plaintext is dumped as well.
fn render(payload: &[u8], transformed: bool, out: &mut String) {
    match value::decode_payload(payload) {
        Ok(values) => {
            out.push_str(&value::render_payload(&values));
            out.push('\n');
            if transformed {
                out.push_str(&hex_dump(payload));
            }
        }
        Err(e) => {
            debug!("Bubuta: {}", e);
            out.push_str("\n[!] Could not decode packet. Raw dump:\n");
            out.push_str(&hex_dump(payload));
        }
    }
}

/// Reader that XORs everything it returns with the connection key.
///
/// The key is looked up once the first bytes of the frame are in, never
/// while waiting for them, and then stays fixed for the rest of the frame.
/// A key installed by the other direction while this one was idle thus
/// applies to the very next frame.
struct KeyedReader<'k, R> {
    inner: R,
    shared: &'k Mutex<Vec<u8>>,
    key: Option<Vec<u8>>,
    position: usize,
}

impl<'k, R: Reader> KeyedReader<'k, R> {
    fn new(inner: R, shared: &'k Mutex<Vec<u8>>) -> Self {
        Self {
            inner,
            shared,
            key: None,
            position: 0,
        }
    }

    /// Whether the frame read so far was XORed with a non-empty key
    fn is_keyed(&self) -> bool {
        self.key.as_ref().is_some_and(|key| !key.is_empty())
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let key = self.key.get_or_insert_with(|| self.shared.lock().clone());
        if key.is_empty() {
            return;
        }
        for byte in data {
            *byte ^= key[self.position % key.len()];
            self.position += 1;
        }
    }
}

impl<R: Reader> Reader for KeyedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        self.decrypt(&mut buf[..n]);
        Ok(n)
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_fully(buf)?;
        self.decrypt(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::value::{encode_payload, Value};
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    /// Blocking source fed chunk by chunk from another thread
    struct Feed {
        chunks: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Reader for Feed {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.pending.is_empty() {
                match self.chunks.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn frame(food_group: u8, kind: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = ((payload.len() + 4) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0x00, food_group, kind, flags]);
        frame.extend_from_slice(payload);
        frame
    }

    fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn sample_payload() -> Vec<u8> {
        encode_payload(&[Value::Object(vec![(
            Value::string("a"),
            Value::Array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]),
        )])])
    }

    #[test]
    fn test_plain_frame() {
        let data = frame(2, 5, 0, &sample_payload());
        let mut input: &[u8] = &data;

        let text = Bubuta::new().dump(false, &mut input).unwrap();
        assert_eq!(text, "--[2/5]--\n[{\"a\":[1,2,3]}]\n");
        assert!(input.is_empty());
    }

    #[test]
    fn test_bad_frame_length_consumes_header_only() {
        let mut data = MAX_FRAME_LENGTH.to_be_bytes().to_vec();
        data.push(0x00);
        data.extend_from_slice(&[0xAA; 16]);
        let mut input: &[u8] = &data;

        let text = Bubuta::new().dump(true, &mut input).unwrap();
        assert_eq!(text, "\nBad frame length.\n");
        assert_eq!(input.len(), 16);

        let mut short: &[u8] = &[0, 0, 0, 3, 0];
        assert_eq!(Bubuta::new().dump(true, &mut short).unwrap(), "\nBad frame length.\n");
    }

    #[test]
    fn test_compressed_frame() {
        let data = frame(3, 1, 0x01, &gzip(&sample_payload()));
        let mut input: &[u8] = &data;

        let text = Bubuta::new().dump(true, &mut input).unwrap();
        assert!(text.starts_with("--[3/1, flags=1]--\n[{\"a\":[1,2,3]}]\n"));
    }

    #[test]
    fn test_bad_gzip_keeps_dissecting() {
        let mut data = frame(3, 1, 0x01, b"not gzip at all");
        data.extend_from_slice(&frame(3, 2, 0, &sample_payload()));
        let mut input: &[u8] = &data;
        let bubuta = Bubuta::new();

        let text = bubuta.dump(true, &mut input).unwrap();
        assert!(text.contains("[!] Could not uncompress packet. Raw dump:\n"));
        assert!(text.contains("not gzip"));

        let text = bubuta.dump(true, &mut input).unwrap();
        assert_eq!(text, "--[3/2]--\n[{\"a\":[1,2,3]}]\n");
    }

    #[test]
    fn test_undecodable_payload() {
        let data = frame(1, 1, 0, &[0x00, 0x01, 0x09]);
        let mut input: &[u8] = &data;

        let text = Bubuta::new().dump(false, &mut input).unwrap();
        assert!(text.starts_with("--[1/1]--\n\n[!] Could not decode packet. Raw dump:\n00 01 09"));
    }

    #[test]
    fn test_installed_key_decrypts_following_frames() {
        let key = b"k3y!".to_vec();
        let mut install = vec![0u8; 11];
        install.extend_from_slice(&key);
        let plain = frame(2, 5, 0, &sample_payload());

        let mut data = frame(0, 1, 0, &install);
        data.extend_from_slice(&xor(&plain, &key));
        let mut input: &[u8] = &data;
        let bubuta = Bubuta::new();

        bubuta.dump(false, &mut input).unwrap();
        assert_eq!(bubuta.key(), key);

        let text = bubuta.dump(true, &mut input).unwrap();
        assert!(text.starts_with("--[2/5]--\n[{\"a\":[1,2,3]}]\n"));

        // Same ciphertext without the key is garbage
        let encrypted = xor(&plain, &key);
        let mut input: &[u8] = &encrypted;
        let text = Bubuta::new().dump(true, &mut input).unwrap();
        assert!(!text.contains("[{\"a\":[1,2,3]}]"));
    }

    #[test]
    fn test_key_installed_while_other_direction_waits() {
        let bubuta = Arc::new(Bubuta::new());
        let (feed, chunks) = mpsc::channel();
        let waiting = {
            let bubuta = bubuta.clone();
            thread::spawn(move || {
                let mut input = Feed {
                    chunks,
                    pending: Vec::new(),
                };
                bubuta.dump(true, &mut input)
            })
        };
        thread::sleep(Duration::from_millis(50));

        let key = b"k3y!".to_vec();
        let mut install = vec![0u8; 11];
        install.extend_from_slice(&key);
        let install = frame(0, 1, 0, &install);
        let mut input: &[u8] = &install;
        bubuta.dump(false, &mut input).unwrap();
        assert_eq!(bubuta.key(), key);

        feed.send(xor(&frame(2, 5, 0, &sample_payload()), &key)).unwrap();
        let text = waiting.join().unwrap().unwrap();
        assert!(text.starts_with("--[2/5]--\n[{\"a\":[1,2,3]}]\n"));
    }

    #[test]
    fn test_key_option() {
        let bubuta_plugin = PLUGIN;
        let plain = frame(2, 5, 0, &sample_payload());
        let encrypted = xor(&plain, &[0x01, 0x02]);

        let protocol = bubuta_plugin.create(&PluginOptions::parse("key=0102")).unwrap();
        let mut input: &[u8] = &encrypted;
        assert!(protocol.dump(false, &mut input).unwrap().contains("[{\"a\":[1,2,3]}]"));

        assert!(matches!(
            bubuta_plugin.create(&PluginOptions::parse("key=xyz")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_end_of_stream() {
        let data = frame(2, 5, 0, &sample_payload());
        let mut input: &[u8] = &data[..data.len() - 1];
        assert!(Bubuta::new().dump(false, &mut input).unwrap_err().is_end_of_stream());
    }
}
