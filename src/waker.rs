use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ready::Ready;
use crate::sys::Poller;
use crate::token::Token;

/// Cross-thread wakeup signal backed by an eventfd.
///
/// Wakes coalesce: the first [`wake`] after a [`drain`] arms the fd with
/// one write syscall, every further wake is a single atomic swap. The
/// consumer drains right before parking and then re-checks its work
/// source; that re-check covers the window where a wake lands between the
/// fd read and the flag reset.
///
/// [`wake`]: Waker::wake
/// [`drain`]: Waker::drain
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<WakerFd>,
}

#[derive(Debug)]
struct WakerFd {
    fd: RawFd,
    armed: AtomicBool,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(Waker {
            inner: Arc::new(WakerFd {
                fd,
                armed: AtomicBool::new(false),
            }),
        })
    }

    /// Make the fd readable. A no-op while a previous wake is still
    /// undrained.
    pub fn wake(&self) -> io::Result<()> {
        if self.inner.armed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.inner.fd,
                &one as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };

        if ret == -1 {
            let err = io::Error::last_os_error();
            // a saturated counter still reads as a pending wakeup
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Swallow the pending wakeup, if any. The fd is read before the flag
    /// resets, so a wake racing this call either lands on the cleared fd
    /// or leaves work the caller's re-check will find.
    pub fn drain(&self) -> io::Result<()> {
        let mut count: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.inner.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };

        self.inner.armed.store(false, Ordering::Release);

        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }

        Ok(())
    }

    pub(crate) fn register(&self, poller: &Poller, token: Token) -> io::Result<()> {
        poller.add(self.inner.fd, token, Ready::readable())
    }

    pub(crate) fn deregister(&self, poller: &Poller) -> io::Result<()> {
        poller.remove(self.inner.fd)
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd
    }
}

impl Drop for WakerFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::Waker;
    use crate::sys;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    #[test]
    fn wake_arms_and_drain_clears() {
        let waker = Waker::new().unwrap();

        waker.wake().unwrap();
        assert!(sys::park_readable(waker.as_raw_fd(), Duration::from_millis(100)).unwrap());

        waker.drain().unwrap();
        assert!(!sys::park_readable(waker.as_raw_fd(), Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn repeated_wakes_coalesce_into_one_drain() {
        let waker = Waker::new().unwrap();

        waker.wake().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();

        waker.drain().unwrap();
        assert!(!sys::park_readable(waker.as_raw_fd(), Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn wake_after_drain_rearms() {
        let waker = Waker::new().unwrap();

        waker.wake().unwrap();
        waker.drain().unwrap();
        waker.wake().unwrap();

        assert!(sys::park_readable(waker.as_raw_fd(), Duration::from_millis(100)).unwrap());
    }
}
