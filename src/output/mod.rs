//! Dissection log
//!
//! Every dissected message is written as one block:
//!
//! ```text
//! ==[3 ▲]==[Tue Oct 14 17:01:12 2025]=============================================
//! <dissector text>
//! <hex/ASCII dump of the consumed bytes>
//! ```

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Column width the message header is padded to
pub const HEADER_WIDTH: usize = 80;

/// Direction glyph for server-to-client messages
pub const INCOMING_GLYPH: char = '▼';

/// Direction glyph for client-to-server messages
pub const OUTGOING_GLYPH: char = '▲';

/// Shared destination of all dissected messages
pub struct LogSink {
    out: Mutex<Box<dyn Write + Send>>,
    raw_dump: bool,
}

impl LogSink {
    pub fn new(out: Box<dyn Write + Send>, raw_dump: bool) -> Self {
        Self {
            out: Mutex::new(out),
            raw_dump,
        }
    }

    pub fn stdout(raw_dump: bool) -> Self {
        Self::new(Box::new(io::stdout()), raw_dump)
    }

    /// Open a log file, truncating it unless `append` is set
    pub fn open<P: AsRef<Path>>(path: P, append: bool, raw_dump: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Self::new(Box::new(file), raw_dump))
    }

    /// Write one complete message; concurrent messages never interleave.
    pub fn message(&self, connection: u32, incoming: bool, text: &str, raw: &[u8]) -> io::Result<()> {
        let mut block = header(connection, incoming, &Local::now());
        block.push('\n');
        block.push_str(text);
        if !text.ends_with('\n') {
            block.push('\n');
        }
        if self.raw_dump && !raw.is_empty() {
            block.push_str(&hex_dump(raw));
        }
        block.push('\n');

        let mut out = self.out.lock();
        out.write_all(block.as_bytes())?;
        out.flush()
    }
}

/// Message header padded with `=` to [`HEADER_WIDTH`] columns
pub fn header(connection: u32, incoming: bool, now: &DateTime<Local>) -> String {
    let glyph = if incoming { INCOMING_GLYPH } else { OUTGOING_GLYPH };
    let mut line = format!(
        "==[{} {}]==[{}]==",
        connection,
        glyph,
        now.format("%a %b %e %H:%M:%S %Y")
    );
    let width = line.chars().count();
    line.extend(std::iter::repeat('=').take(HEADER_WIDTH.saturating_sub(width)));
    line
}

/// Hex and ASCII rendering, 16 bytes per line
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for chunk in data.chunks(16) {
        let mut hex = String::with_capacity(50);
        for (i, byte) in chunk.iter().enumerate() {
            let _ = write!(hex, "{:02x} ", byte);
            if i == 7 {
                hex.push(' ');
            }
        }
        let _ = write!(out, "{:<50}", hex);
        out.extend(chunk.iter().map(|&b| {
            if (32..127).contains(&b) {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
