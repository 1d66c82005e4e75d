//! Sniffer controller
//!
//! Owns every live connection in a slot arena and runs the poll thread,
//! which is the only reader of proxied sockets and the only reaper of
//! finished connections. The accept loop hands new connections over with
//! [`Sniffer::add`] and never touches them again.

use crate::channel::Channel;
use crate::connection::Connection;
use crate::output::LogSink;
use crate::protocol::{Plugin, PluginOptions, Protocol, Transport};
use crate::proxy;
use crate::transport::{self, poll_readable, HostAddress, Waker};
use crate::{Error, Result, POLL_TIMEOUT};
use parking_lot::Mutex;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn, Span};

/// Default read timeout for the SOCKS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the server side of a new connection is found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Relay every client to one fixed remote host
    Forward(HostAddress),
    /// Ask each client through a SOCKS4/SOCKS5 handshake
    Socks,
}

/// State shared with the poll thread
struct Shared {
    slots: Mutex<Vec<Option<Connection>>>,
    running: AtomicBool,
    waker: Waker,
}

impl Shared {
    fn poll_loop(&self) {
        debug!("Poll thread started");
        while self.running.load(Ordering::Acquire) {
            // (source, peer) pairs whose source still deserves a read
            let directions: Vec<(Arc<Channel>, Arc<Channel>)> = {
                let slots = self.slots.lock();
                slots
                    .iter()
                    .flatten()
                    .flat_map(Connection::directions)
                    .filter(|(source, _)| source.is_alive())
                    .collect()
            };

            let mut fds: Vec<RawFd> = directions.iter().map(|(source, _)| source.descriptor()).collect();
            fds.push(self.waker.descriptor());

            let ready = wait_readable(&fds, "socket readiness");
            for ((source, peer), _) in directions.iter().zip(&ready).filter(|(_, r)| **r) {
                source.notify(peer);
            }
            if ready.last() == Some(&true) {
                self.waker.drain();
            }

            self.reap();
        }
        debug!("Poll thread stopped");
    }

    /// Remove dead connections; they are destroyed outside the lock.
    fn reap(&self) {
        let dead: Vec<Connection> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter(|slot| matches!(slot, Some(connection) if !connection.is_alive()))
                .filter_map(Option::take)
                .collect()
        };
        for connection in dead {
            debug!("Connection #{}: reaped", connection.id());
        }
    }
}

/// Wait until any of `fds` is readable.
///
/// A failed wait is logged and reported as nothing ready, so callers just
/// go around their loop again.
fn wait_readable(fds: &[RawFd], what: &str) -> Vec<bool> {
    match poll_readable(fds, POLL_TIMEOUT) {
        Ok(ready) => ready,
        Err(e) => {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("Waiting for {}: {}", what, e);
                thread::sleep(Duration::from_millis(100));
            }
            vec![false; fds.len()]
        }
    }
}

/// Process-wide connection controller
pub struct Sniffer {
    shared: Arc<Shared>,
    plugin: Plugin,
    options: PluginOptions,
    log: Arc<LogSink>,
    next_id: AtomicU32,
    handshake_timeout: Duration,
    poller: Option<JoinHandle<()>>,
}

impl Sniffer {
    /// Validate the plugin setup and start the poll thread.
    pub fn new(plugin: Plugin, options: PluginOptions, log: Arc<LogSink>) -> Result<Self> {
        plugin.require(Transport::Stream)?;
        // Bad options surface now rather than on the first connection
        plugin.create(&options)?;

        let shared = Arc::new(Shared {
            slots: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            waker: Waker::new().map_err(Error::transport("creating control socket"))?,
        });

        let poller = {
            let shared = shared.clone();
            let span = Span::current();
            thread::Builder::new()
                .name("poll".to_string())
                .spawn(move || span.in_scope(|| shared.poll_loop()))
                .map_err(Error::transport("starting thread"))?
        };

        info!("Sniffer started with protocol {}", plugin.name);
        Ok(Self {
            shared,
            plugin,
            options,
            log,
            next_id: AtomicU32::new(1),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            poller: Some(poller),
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Number of connections not yet reaped
    pub fn connection_count(&self) -> usize {
        self.shared.slots.lock().iter().flatten().count()
    }

    /// Hand a running connection over to the poll thread.
    pub fn add(&self, connection: Connection) {
        {
            let mut slots = self.shared.slots.lock();
            match slots.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(connection),
                None => slots.push(Some(connection)),
            }
        }
        self.shared.waker.wake();
    }

    /// Build a connection for an accepted client and register it.
    ///
    /// Returns the new connection's id. Failures are logged with the id they
    /// would have had and the client socket is closed.
    pub fn open(&self, client: TcpStream, target: &Target) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.establish(id, client, target) {
            Ok(connection) => {
                self.add(connection);
                Ok(id)
            }
            Err(e) => {
                error!("Connection #{}: {}", id, e);
                Err(e)
            }
        }
    }

    fn establish(&self, id: u32, mut client: TcpStream, target: &Target) -> Result<Connection> {
        let server = match target {
            Target::Forward(remote) => {
                let server = transport::connect(remote)?;
                info!("Connection #{}: forwarding to {}", id, remote);
                server
            }
            Target::Socks => {
                client
                    .set_read_timeout(Some(self.handshake_timeout))
                    .map_err(Error::transport("setting socket option"))?;
                let handshake = proxy::accept(&mut client, transport::connect)?;
                client
                    .set_read_timeout(None)
                    .map_err(Error::transport("setting socket option"))?;
                info!(
                    "Connection #{}: {} tunnel to {}",
                    id, handshake.version, handshake.target
                );
                handshake.server
            }
        };

        let protocol: Arc<dyn Protocol> = Arc::from(self.plugin.create(&self.options)?);
        Connection::start(id, client, server, protocol, self.log.clone())
    }

    /// Accept clients until `shutdown` is triggered.
    ///
    /// One failed client never stops the loop.
    pub fn serve(&self, listener: &TcpListener, target: &Target, shutdown: &Shutdown) -> Result<()> {
        let fds = [listener.as_raw_fd(), shutdown.descriptor()];
        while !shutdown.is_triggered() {
            let ready = wait_readable(&fds, "clients");
            if ready[1] || shutdown.is_triggered() {
                break;
            }
            if !ready[0] {
                continue;
            }

            match listener.accept() {
                Ok((client, peer)) => {
                    debug!("Accepted client from {}", peer);
                    let _ = self.open(client, target);
                }
                Err(e) => warn!("Accepting connection: {}", e),
            }
        }
        info!("Stopped accepting connections");
        Ok(())
    }

    /// Stop the poll thread and destroy every remaining connection.
    pub fn shutdown(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        self.shared.waker.wake();
        if poller.join().is_err() {
            error!("Poll thread panicked");
        }

        let remaining: Vec<Connection> = self.shared.slots.lock().drain(..).flatten().collect();
        if !remaining.is_empty() {
            info!("Closing {} remaining connection(s)", remaining.len());
        }
        drop(remaining);
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable stop signal for the accept loop, safe to trigger from a
/// signal handler thread
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    triggered: AtomicBool,
    waker: Waker,
}

impl Shutdown {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ShutdownInner {
                triggered: AtomicBool::new(false),
                waker: Waker::new().map_err(Error::transport("creating control socket"))?,
            }),
        })
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        self.inner.waker.wake();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    fn descriptor(&self) -> RawFd {
        self.inner.waker.descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Capabilities, Reader};
    use std::io::{Read, Write};
    use std::time::Instant;

    struct Bytes;

    impl Protocol for Bytes {
        fn dump(&self, _incoming: bool, input: &mut dyn Reader) -> Result<String> {
            Ok(format!("{:02x}", input.read_u8()?))
        }
    }

    fn bytes_plugin(capabilities: Capabilities) -> Plugin {
        Plugin {
            name: "bytes",
            description: "One byte per message",
            version: 1,
            capabilities,
            factory: bytes_factory,
        }
    }

    fn bytes_factory(_options: &PluginOptions) -> Result<Box<dyn Protocol>> {
        Ok(Box::new(Bytes))
    }

    fn sniffer() -> Sniffer {
        let log = Arc::new(LogSink::new(Box::new(io::sink()), false));
        Sniffer::new(bytes_plugin(Capabilities::STREAM), PluginOptions::default(), log).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_datagram_only_plugin_is_refused() {
        let log = Arc::new(LogSink::new(Box::new(io::sink()), false));
        let result = Sniffer::new(bytes_plugin(Capabilities::DATAGRAM), PluginOptions::default(), log);
        assert!(matches!(result, Err(Error::UnsupportedTransport { plugin: "bytes", .. })));
    }

    #[test]
    fn test_forward_relays_and_reaps() {
        let sniffer = sniffer();
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = Target::Forward(HostAddress::new("127.0.0.1", upstream.local_addr().unwrap().port()));

        let front = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(front.local_addr().unwrap()).unwrap();
        let (accepted, _) = front.accept().unwrap();

        let id = sniffer.open(accepted, &target).unwrap();
        assert_eq!(id, 1);
        let (mut server, _) = upstream.accept().unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(sniffer.connection_count(), 1);

        drop(server);
        assert!(wait_until(|| sniffer.connection_count() == 0));
    }

    #[test]
    fn test_failed_open_consumes_an_id() {
        let sniffer = sniffer();
        let closed_port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let target = Target::Forward(HostAddress::new("127.0.0.1", closed_port));

        let front = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(front.local_addr().unwrap()).unwrap();
        let (accepted, _) = front.accept().unwrap();

        assert!(sniffer.open(accepted, &target).is_err());
        assert_eq!(sniffer.next_id.load(Ordering::Relaxed), 2);
        assert_eq!(sniffer.connection_count(), 0);
    }

    #[test]
    fn test_failed_wait_reports_nothing_ready() {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `limit` is a valid, exclusively borrowed rlimit.
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
        if limit.rlim_cur > 1 << 22 {
            return;
        }

        // More descriptors than the process may open: poll(2) fails with EINVAL
        let fds = vec![-1; limit.rlim_cur as usize + 1];
        assert!(poll_readable(&fds, Duration::ZERO).is_err());
        assert!(wait_readable(&fds, "clients").iter().all(|ready| !ready));
    }

    #[test]
    fn test_serve_stops_on_shutdown() {
        let sniffer = Arc::new(sniffer());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let shutdown = Shutdown::new().unwrap();

        let server = {
            let sniffer = sniffer.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || sniffer.serve(&listener, &Target::Socks, &shutdown))
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        shutdown.trigger();
        server.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_shutdown_destroys_connections() {
        let mut sniffer = sniffer();
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = Target::Forward(HostAddress::new("127.0.0.1", upstream.local_addr().unwrap().port()));

        let front = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(front.local_addr().unwrap()).unwrap();
        let (accepted, _) = front.accept().unwrap();
        sniffer.open(accepted, &target).unwrap();
        let _server = upstream.accept().unwrap();

        sniffer.shutdown();
        assert_eq!(sniffer.connection_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
