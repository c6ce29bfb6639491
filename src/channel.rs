use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Ordered in-memory byte queue with a capacity bound.
///
/// Writers append with [`write_end`]; readers take a locked view, consume a
/// prefix and [`compact`]. The capacity bound is enforced cooperatively:
/// producers ask [`wait_space`] before appending, and a consumer freeing
/// bytes wakes them. Once released the channel refuses writes and reports
/// [`is_released`], so a reader racing a release observes a closed channel
/// instead of freed memory.
///
/// [`write_end`]: ByteChannel::write_end
/// [`compact`]: ChannelGuard::compact
/// [`wait_space`]: ByteChannel::wait_space
/// [`is_released`]: ByteChannel::is_released
#[derive(Clone)]
pub struct ByteChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    space: Condvar,
}

struct ChannelState {
    buf: Vec<u8>,
    head: usize,
    max_size: usize,
    released: bool,
}

impl ByteChannel {
    pub fn new(max_size: usize) -> ByteChannel {
        ByteChannel {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    buf: Vec::new(),
                    head: 0,
                    max_size,
                    released: false,
                }),
                space: Condvar::new(),
            }),
        }
    }

    pub fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            state: self.inner.state.lock().unwrap(),
            space: &self.inner.space,
        }
    }

    pub fn write_end(&self, src: &[u8]) -> io::Result<usize> {
        self.lock().write_end(src)
    }

    pub fn size(&self) -> usize {
        self.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_size(&self) -> usize {
        self.inner.state.lock().unwrap().max_size
    }

    /// The conservative overflow predicate: appending `incoming` bytes
    /// would reach or pass the capacity bound.
    pub fn would_overflow(&self, incoming: usize) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.released && state.size() + incoming >= state.max_size
    }

    /// Block until `incoming` bytes fit below the bound, a release happens,
    /// or `timeout` elapses. Returns `false` only on timeout.
    pub fn wait_space(&self, incoming: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.released || state.size() + incoming < state.max_size {
                return true;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }

            let (next, _) = self
                .inner
                .space
                .wait_timeout(state, timeout - elapsed)
                .unwrap();
            state = next;
        }
    }

    /// Copy out up to `dst.len()` bytes, freeing capacity. The application
    /// side of the channel.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut guard = self.lock();
        let n = {
            let readable = guard.readable();
            let n = readable.len().min(dst.len());
            dst[..n].copy_from_slice(&readable[..n]);
            n
        };
        guard.consume(n);
        guard.compact();
        n
    }

    pub fn compact(&self) {
        self.lock().compact();
    }

    /// Drop buffered bytes and refuse further writes. Idempotent; wakes
    /// every producer parked in [`wait_space`](ByteChannel::wait_space).
    pub fn release(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.released {
            state.released = true;
            state.buf = Vec::new();
            state.head = 0;
        }
        self.inner.space.notify_all();
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().unwrap().released
    }
}

impl ChannelState {
    fn size(&self) -> usize {
        self.buf.len() - self.head
    }
}

/// Locked access to the channel contents. Consumed bytes stay in place
/// until [`compact`](ChannelGuard::compact) discards the prefix.
pub struct ChannelGuard<'a> {
    state: MutexGuard<'a, ChannelState>,
    space: &'a Condvar,
}

impl ChannelGuard<'_> {
    pub fn readable(&self) -> &[u8] {
        &self.state.buf[self.state.head..]
    }

    pub fn consume(&mut self, n: usize) {
        let head = self.state.head + n;
        assert!(head <= self.state.buf.len());
        self.state.head = head;
    }

    pub fn compact(&mut self) {
        if self.state.head > 0 {
            let head = self.state.head;
            self.state.buf.drain(..head);
            self.state.head = 0;
            self.space.notify_all();
        }
    }

    pub fn write_end(&mut self, src: &[u8]) -> io::Result<usize> {
        if self.state.released {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "byte channel released",
            ));
        }

        self.state.buf.extend_from_slice(src);
        Ok(src.len())
    }

    pub fn size(&self) -> usize {
        self.state.size()
    }

    pub fn is_released(&self) -> bool {
        self.state.released
    }
}
