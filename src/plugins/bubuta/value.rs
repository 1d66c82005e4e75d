//! Self-describing payload structure
//!
//! Every value starts with a one-byte tag; lengths are big-endian.
//!
//! | Tag | Value | Body |
//! |---|---|---|
//! | 0 | binary | 3-byte length, raw bytes |
//! | 1 | string | 2-byte length, bytes |
//! | 3 | integer | 4 bytes, signed |
//! | 4 | array | 2-byte count, values |
//! | 5 | object | 2-byte count, key/value pairs |
//!
//! A frame payload is the body of an array without its tag.

use std::fmt::{self, Write as _};
use thiserror::Error;

const TAG_BINARY: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_ARRAY: u8 = 4;
const TAG_OBJECT: u8 = 5;

/// Deepest nesting accepted before a payload is considered garbage
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Binary(Vec<u8>),
    String(Vec<u8>),
    Integer(i32),
    Array(Vec<Value>),
    Object(Vec<(Value, Value)>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("premature end of payload at offset {0}")]
    PrematureEnd(usize),

    #[error("unknown type {tag} at offset {offset}")]
    UnknownType { tag: u8, offset: usize },

    #[error("nesting deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

/// Decode a frame payload into its top-level elements.
///
/// Bytes after the last element are ignored.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<Value>, DecodeError> {
    let mut decoder = Decoder {
        data: payload,
        offset: 0,
    };
    decoder.array_body(0)
}

/// Encode top-level elements as a frame payload
pub fn encode_payload(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        value.encode(&mut out);
    }
    out
}

/// Render top-level elements the way a nested array is rendered
pub fn render_payload(values: &[Value]) -> String {
    let mut out = String::new();
    let _ = write_list(&mut out, values);
    out
}

struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Decoder<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(DecodeError::PrematureEnd(self.offset))?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Big-endian unsigned integer of `octets` bytes
    fn number(&mut self, octets: usize) -> Result<u32, DecodeError> {
        Ok(self
            .take(octets)?
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        let offset = self.offset;
        match self.number(1)? as u8 {
            TAG_BINARY => {
                let len = self.number(3)? as usize;
                Ok(Value::Binary(self.take(len)?.to_vec()))
            }
            TAG_STRING => {
                let len = self.number(2)? as usize;
                Ok(Value::String(self.take(len)?.to_vec()))
            }
            TAG_INTEGER => Ok(Value::Integer(self.number(4)? as i32)),
            TAG_ARRAY => Ok(Value::Array(self.array_body(depth + 1)?)),
            TAG_OBJECT => {
                let count = self.number(2)?;
                let mut pairs = Vec::new();
                for _ in 0..count {
                    let key = self.value(depth + 1)?;
                    let value = self.value(depth + 1)?;
                    pairs.push((key, value));
                }
                Ok(Value::Object(pairs))
            }
            tag => Err(DecodeError::UnknownType { tag, offset }),
        }
    }

    fn array_body(&mut self, depth: usize) -> Result<Vec<Value>, DecodeError> {
        let count = self.number(2)?;
        // Capacity is not trusted from the wire
        let mut values = Vec::new();
        for _ in 0..count {
            values.push(self.value(depth)?);
        }
        Ok(values)
    }
}

impl Value {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Binary(bytes) => {
                out.push(TAG_BINARY);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes()[1..]);
                out.extend_from_slice(bytes);
            }
            Value::String(bytes) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Value::Integer(n) => {
                out.push(TAG_INTEGER);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Value::Array(values) => {
                out.push(TAG_ARRAY);
                out.extend_from_slice(&encode_payload(values));
            }
            Value::Object(pairs) => {
                out.push(TAG_OBJECT);
                out.extend_from_slice(&(pairs.len() as u16).to_be_bytes());
                for (key, value) in pairs {
                    key.encode(out);
                    value.encode(out);
                }
            }
        }
    }

    pub fn string(text: &str) -> Value {
        Value::String(text.as_bytes().to_vec())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Binary(bytes) => write!(f, "`{}`", hex::encode(bytes)),
            Value::String(bytes) => write_string(f, bytes),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Array(values) => write_list(f, values),
            Value::Object(pairs) => {
                f.write_char('{')?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i != 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{}:{}", key, value)?;
                }
                f.write_char('}')
            }
        }
    }
}

fn write_list<W: fmt::Write>(out: &mut W, values: &[Value]) -> fmt::Result {
    out.write_char('[')?;
    for (i, value) in values.iter().enumerate() {
        if i != 0 {
            out.write_char(',')?;
        }
        write!(out, "{}", value)?;
    }
    out.write_char(']')
}

/// Quoted string with C-style escapes for control characters
fn write_string<W: fmt::Write>(out: &mut W, bytes: &[u8]) -> fmt::Result {
    out.write_char('"')?;
    for ch in String::from_utf8_lossy(bytes).chars() {
        match ch {
            '\0' => out.write_str("\\0")?,
            '\x07' => out.write_str("\\a")?,
            '\x08' => out.write_str("\\b")?,
            '\t' => out.write_str("\\t")?,
            '\n' => out.write_str("\\n")?,
            '\x0b' => out.write_str("\\v")?,
            '\x0c' => out.write_str("\\f")?,
            '\r' => out.write_str("\\r")?,
            c if (c as u32) < 0x20 => write!(out, "\\x{:02x}", c as u32)?,
            '\\' | '"' => {
                out.write_char('\\')?;
                out.write_char(ch)?;
            }
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}
