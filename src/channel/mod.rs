//! One direction of a proxied connection
//!
//! A `Channel` separates "bytes arrived on the wire" from "the dissector wants
//! N bytes now". The poll thread is the only caller of [`Channel::notify`],
//! the only place a socket is read. Dissector threads only consume the
//! in-memory queue through the [`Reader`] impl and sleep on a condition
//! variable while it is short.

use crate::protocol::Reader;
use crate::{Error, Result, CHUNK_SIZE};
use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, trace};

struct State {
    buffer: BytesMut,
    alive: bool,
}

/// Socket plus the bytes read from it but not yet dissected
pub struct Channel {
    stream: TcpStream,
    state: Mutex<State>,
    ready: Condvar,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            state: Mutex::new(State {
                buffer: BytesMut::with_capacity(CHUNK_SIZE),
                alive: true,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn descriptor(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    /// Bytes queued but not yet consumed
    pub fn pending(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Handle a readiness report for this channel's socket.
    ///
    /// Reads one chunk, queues it and forwards it unchanged to `peer`. End of
    /// stream or a read error kills this channel; a failed forward kills
    /// `peer`. Blocked readers are woken in every case.
    pub fn notify(&self, peer: &Channel) {
        if self.is_alive() {
            let mut chunk = [0u8; CHUNK_SIZE];
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    debug!("fd {}: end of stream", self.descriptor());
                    self.close();
                }
                Ok(n) => {
                    trace!("fd {}: {} bytes", self.descriptor(), n);
                    self.state.lock().buffer.extend_from_slice(&chunk[..n]);
                    if let Err(e) = peer.forward(&chunk[..n]) {
                        debug!("fd {}: writing to network: {}", peer.descriptor(), e);
                        peer.close();
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
                Err(e) => {
                    debug!("fd {}: reading from network: {}", self.descriptor(), e);
                    self.close();
                }
            }
        }
        self.ready.notify_all();
    }

    /// Mark the channel dead and shut its socket down.
    ///
    /// The descriptor itself stays open until the channel is dropped, so it
    /// cannot be reused while the poll thread may still hold it.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.alive {
                state.alive = false;
                let _ = self.stream.shutdown(Shutdown::Both);
            }
        }
        self.ready.notify_all();
    }

    fn forward(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        (&self.stream).write_all(data)
    }
}

/// Consumer side, used by exactly one dissector thread per channel
impl Reader for &Channel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        while state.alive && state.buffer.is_empty() {
            self.ready.wait(&mut state);
        }
        let n = buf.len().min(state.buffer.len());
        buf[..n].copy_from_slice(&state.buffer[..n]);
        state.buffer.advance(n);
        Ok(n)
    }

    /// Waits for the whole request; never returns a short read.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        while state.alive && state.buffer.len() < buf.len() {
            self.ready.wait(&mut state);
        }
        if state.buffer.len() < buf.len() {
            return Err(Error::EndOfStream);
        }
        buf.copy_from_slice(&state.buffer[..buf.len()]);
        state.buffer.advance(buf.len());
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
