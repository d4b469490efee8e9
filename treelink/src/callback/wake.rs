//! Wake primitives for [`super::CallbackMechanism`].
//!
//! The wake carries no data: the pending map is the source of truth, so a
//! lost or duplicated wake byte only costs an extra (empty) dispatch.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use mio::net::UnixStream;
use parking_lot::{Condvar, Mutex};
use rustix::event::{PollFd, PollFlags, poll};

/// Cross-thread "something is pending" signal.
pub trait Wakeup: Send + Sync {
    /// Makes the next (or a current) [`wait`](Self::wait) return. Callable
    /// from any thread.
    fn signal(&self);

    /// Discards outstanding signals. Called by the consumer before draining.
    fn clear(&self);

    /// Blocks until signalled or `timeout` expires; `None` waits forever.
    /// Returns whether a signal is outstanding.
    fn wait(&self, timeout: Option<Duration>) -> bool;
}

/// A connected pair of non-blocking Unix sockets.
///
/// Hosts with their own event loop poll [`read_fd`](Self::read_fd) for
/// readability and call dispatch when it fires.
pub struct SocketPairWakeup {
    reader: UnixStream,
    writer: UnixStream,
}

impl SocketPairWakeup {
    /// # Errors
    ///
    /// Returns an error if the socket pair cannot be created.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        Ok(Self { reader, writer })
    }

    #[must_use]
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl Wakeup for SocketPairWakeup {
    fn signal(&self) {
        // WouldBlock means the buffer is full, which already guarantees a wake.
        let _ = (&self.writer).write(&[1]);
    }

    fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let timeout_ms = timeout.map_or(-1, |t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX));
        let mut fds = [PollFd::new(&self.reader, PollFlags::IN)];
        loop {
            match poll(&mut fds, timeout_ms) {
                Ok(n) => return n > 0,
                Err(rustix::io::Errno::INTR) => {}
                Err(_) => return false,
            }
        }
    }
}

/// Condition-variable wake for hosts without a file-descriptor event loop.
#[derive(Default)]
pub struct CondvarWakeup {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup for CondvarWakeup {
    fn signal(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.signalled.lock() = false;
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signalled = self.signalled.lock();
        match timeout {
            None => {
                while !*signalled {
                    self.cond.wait(&mut signalled);
                }
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*signalled {
                    if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        *signalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn exercise(wake: Arc<dyn Wakeup>) {
        assert!(!wake.wait(Some(Duration::from_millis(10))));
        wake.signal();
        wake.signal();
        assert!(wake.wait(Some(Duration::from_millis(10))));
        wake.clear();
        assert!(!wake.wait(Some(Duration::from_millis(10))));

        let remote = Arc::clone(&wake);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.signal();
        });
        assert!(wake.wait(Some(Duration::from_secs(2))));
        t.join().unwrap();
    }

    #[test]
    fn socket_pair_signals_and_clears() {
        exercise(Arc::new(SocketPairWakeup::new().unwrap()));
    }

    #[test]
    fn condvar_signals_and_clears() {
        exercise(Arc::new(CondvarWakeup::default()));
    }
}
