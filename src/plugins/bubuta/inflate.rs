//! Gzip payload decompression

use flate2::read::GzDecoder;
use std::io::{self, Read};
use thiserror::Error;

/// Upper bound for one inflated payload
pub const MAX_INFLATED_LEN: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum InflateError {
    #[error("corrupt gzip data: {0}")]
    Corrupt(#[from] io::Error),

    #[error("inflated payload exceeds {} bytes", MAX_INFLATED_LEN)]
    TooLarge,
}

/// Decompress a gzip member.
///
/// The output buffer starts at the compressed size and grows to twice its
/// size plus one each time it turns out too small.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, InflateError> {
    let mut capacity = data.len();
    loop {
        if let Some(inflated) = inflate_into(data, capacity)? {
            return Ok(inflated);
        }
        capacity = capacity * 2 + 1;
        if capacity > MAX_INFLATED_LEN {
            return Err(InflateError::TooLarge);
        }
    }
}

/// One attempt with a buffer of `capacity` bytes; `None` means too small.
fn inflate_into(data: &[u8], capacity: usize) -> io::Result<Option<Vec<u8>>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = vec![0u8; capacity];
    let mut filled = 0;
    while filled < capacity {
        match decoder.read(&mut out[filled..])? {
            0 => {
                out.truncate(filled);
                return Ok(Some(out));
            }
            n => filled += n,
        }
    }

    let mut probe = [0u8; 1];
    match decoder.read(&mut probe)? {
        0 => Ok(Some(out)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_highly_compressible_payload_grows_buffer() {
        let original = vec![b'z'; 100_000];
        let compressed = gzip(&original);
        assert!(compressed.len() < 1000);

        assert_eq!(gunzip(&compressed).unwrap(), original);
    }

    #[test]
    fn test_incompressible_payload() {
        let original: Vec<u8> = (0..2000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        assert_eq!(gunzip(&gzip(&original)).unwrap(), original);
    }

    #[test]
    fn test_empty_member() {
        assert_eq!(gunzip(&gzip(b"")).unwrap(), b"");
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(gunzip(b"definitely not gzip"), Err(InflateError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_member_is_corrupt() {
        let compressed = gzip(b"hello hello hello hello");
        assert!(gunzip(&compressed[..compressed.len() - 6]).is_err());
    }
}
