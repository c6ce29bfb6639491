use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::Poller;
use crate::token::Token;
use crate::waker::Waker;

pub use concurrent_queue::{ConcurrentQueue, PopError, PushError};

/// Unbounded multi-producer task inbox whose non-empty state is mirrored
/// on an eventfd, so the consumer can park on the fd (directly, or through
/// a poller watching it) instead of spinning.
///
/// Every push wakes; the [`Waker`] coalesces the syscalls. Before parking
/// the consumer calls [`settle`], which drains the signal and re-checks
/// the queue, re-arming if anything slipped in. No job is ever stranded
/// behind a cleared fd.
///
/// [`settle`]: Queue::settle
pub struct Queue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    jobs: ConcurrentQueue<T>,
    waker: Waker,
}

impl<T: Send> Queue<T> {
    pub fn unbounded() -> io::Result<Queue<T>> {
        Ok(Queue {
            inner: Arc::new(QueueInner {
                jobs: ConcurrentQueue::unbounded(),
                waker: Waker::new()?,
            }),
        })
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner.jobs.push(value)?;
        let _ = self.inner.waker.wake();
        Ok(())
    }

    pub fn pop(&self) -> Result<T, PopError> {
        self.inner.jobs.pop()
    }

    /// Prepare to park: clear the wake signal, then look again. Returns
    /// `false` when jobs arrived meanwhile and parking would oversleep;
    /// the signal is re-armed in that case.
    pub fn settle(&self) -> bool {
        let _ = self.inner.waker.drain();

        if self.inner.jobs.is_empty() {
            true
        } else {
            let _ = self.inner.waker.wake();
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn close(&self) -> bool {
        self.inner.jobs.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.jobs.is_closed()
    }

    /// Arm the fd regardless of queue state. Used on shutdown to get a
    /// parked consumer moving again.
    pub fn wake(&self) -> io::Result<()> {
        self.inner.waker.wake()
    }

    pub(crate) fn register(&self, poller: &Poller, token: Token) -> io::Result<()> {
        self.inner.waker.register(poller, token)?;

        if !self.inner.jobs.is_empty() {
            self.inner.waker.wake()?;
        }

        Ok(())
    }

    pub(crate) fn deregister(&self, poller: &Poller) -> io::Result<()> {
        self.inner.waker.deregister(poller)
    }
}

impl<T: Send> Clone for Queue<T> {
    fn clone(&self) -> Queue<T> {
        Queue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> AsRawFd for Queue<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.waker.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Queue;
    use crate::sys;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    #[test]
    fn push_pop_in_order() {
        let queue: Queue<u32> = Queue::unbounded().unwrap();

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap(), 1);
        assert_eq!(queue.pop().unwrap(), 2);
        assert!(queue.pop().is_err());
    }

    #[test]
    fn close_refuses_push() {
        let queue: Queue<u32> = Queue::unbounded().unwrap();

        queue.close();
        assert!(queue.push(1).is_err());
    }

    #[test]
    fn settle_spots_late_arrivals() {
        let queue: Queue<u32> = Queue::unbounded().unwrap();

        queue.push(7).unwrap();

        // jobs pending: refuse to park and keep the fd armed
        assert!(!queue.settle());
        assert!(sys::park_readable(queue.as_raw_fd(), Duration::from_millis(100)).unwrap());

        queue.pop().unwrap();
        assert!(queue.settle());
        assert!(!sys::park_readable(queue.as_raw_fd(), Duration::from_millis(10)).unwrap());
    }
}
