//! Proxied connection
//!
//! A `Connection` pairs the client and server channels with one dissector
//! instance and runs two threads, one per direction. Each thread repeatedly
//! asks the dissector for the next message read from the side that
//! originates it and writes the rendering to the shared log. Relaying is a
//! side effect of the poll thread reading, so it never waits on these
//! threads.
//!
//! Connections are destroyed only by the controller's reaper; dropping one
//! closes both channels and joins both threads.

use crate::channel::Channel;
use crate::output::LogSink;
use crate::protocol::{Protocol, Reader};
use crate::{Error, Result, SEND_TIMEOUT};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn, Span};

/// One relayed session
pub struct Connection {
    id: u32,
    client: Arc<Channel>,
    server: Arc<Channel>,
    threads: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Wrap both sockets and start the two dissector threads.
    pub fn start(
        id: u32,
        client: TcpStream,
        server: TcpStream,
        protocol: Arc<dyn Protocol>,
        log: Arc<LogSink>,
    ) -> Result<Self> {
        // A peer that stops reading must not stall the poll thread for good
        for stream in [&client, &server] {
            stream
                .set_write_timeout(Some(SEND_TIMEOUT))
                .map_err(Error::transport("setting socket option"))?;
        }

        let mut connection = Self {
            id,
            client: Arc::new(Channel::new(client)),
            server: Arc::new(Channel::new(server)),
            threads: Vec::with_capacity(2),
        };

        for incoming in [false, true] {
            let source = if incoming {
                connection.server.clone()
            } else {
                connection.client.clone()
            };
            let protocol = protocol.clone();
            let log = log.clone();
            let name = format!("conn-{}-{}", id, if incoming { "s2c" } else { "c2s" });
            let span = Span::current();

            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || span.in_scope(|| run_direction(id, incoming, source, protocol, log)))
                .map_err(Error::transport("starting thread"))?;
            connection.threads.push(handle);
        }

        debug!("Connection #{}: dissector threads started", id);
        Ok(connection)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// True while both directions are alive.
    ///
    /// One-way traffic is not worth keeping, so a single dead channel makes
    /// the whole connection eligible for reaping.
    pub fn is_alive(&self) -> bool {
        self.client.is_alive() && self.server.is_alive()
    }

    /// `(source, peer)` pairs: the poll thread reads `source` and relays to `peer`
    pub fn directions(&self) -> [(Arc<Channel>, Arc<Channel>); 2] {
        [
            (self.client.clone(), self.server.clone()),
            (self.server.clone(), self.client.clone()),
        ]
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.client.close();
        self.server.close();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("dissector").to_string();
            if handle.join().is_err() {
                error!("Connection #{}: thread {} panicked", self.id, name);
            }
        }
    }
}

/// Body of one direction thread
fn run_direction(
    id: u32,
    incoming: bool,
    source: Arc<Channel>,
    protocol: Arc<dyn Protocol>,
    log: Arc<LogSink>,
) {
    // Whatever ends this thread, its source is no use to anyone afterwards
    let _guard = CloseOnExit(&*source);
    let peer = if incoming { "server" } else { "client" };

    loop {
        let mut tap = Tap::new(&source);
        let text = match protocol.dump(incoming, &mut tap) {
            Ok(text) => text,
            Err(Error::EndOfStream) => {
                info!("Connection #{}: disconnected from {}", id, peer);
                break;
            }
            Err(e) if tap.captured.is_empty() => {
                error!("Connection #{}: dissecting {} data: {}", id, peer, e);
                break;
            }
            Err(e) => format!("[!] Internal error: {}", e),
        };

        if let Err(e) = log.message(id, incoming, &text, &tap.captured) {
            warn!("Connection #{}: writing log: {}", id, e);
        }
    }
}

struct CloseOnExit<'a>(&'a Channel);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Reader that remembers every byte handed to the dissector
struct Tap<'a> {
    inner: &'a Channel,
    captured: Vec<u8>,
}

impl<'a> Tap<'a> {
    fn new(inner: &'a Channel) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }
}

impl Reader for Tap<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner;
        let n = inner.read(buf)?;
        self.captured.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner;
        inner.read_fully(buf)?;
        self.captured.extend_from_slice(buf);
        Ok(())
    }
}
