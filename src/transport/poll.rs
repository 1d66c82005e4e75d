//! Readiness wait over raw descriptors

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Wait until any of `fds` is readable or `timeout` elapses.
///
/// The result has one flag per descriptor. Hang-ups and errors count as
/// readable so the owner observes them through its next read.
pub fn poll_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: `pollfds` is a valid, exclusively borrowed array of
    // `pollfds.len()` entries for the duration of the call.
    let ret = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    Ok(pollfds.iter().map(|p| p.revents & ready != 0).collect())
}

/// Control descriptor used to interrupt a readiness wait
pub struct Waker {
    tx: UnixStream,
    rx: UnixStream,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx })
    }

    /// Descriptor that turns readable after [`Waker::wake`]
    pub fn descriptor(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    pub fn wake(&self) {
        // A full socket buffer already guarantees a pending wake-up
        let _ = (&self.tx).write(&[1]);
    }

    /// Consume pending wake-ups
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}
