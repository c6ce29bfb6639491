use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::cmp;

use libc::c_int;

use crate::ready::Ready;
use crate::token::Token;

/// Level-triggered epoll instance, reduced to the three calls the selector
/// makes: install a descriptor, drop it, wait. Peer half-close is always
/// part of the subscription, so a session hears about a dying remote even
/// when only read interest was requested.
pub struct Poller {
    fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Poller { fd })
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_bits(interest),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event))?;

        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut unused = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, &mut unused))?;

        Ok(())
    }

    /// Fill `set` with whatever is ready, blocking at most `timeout`. An
    /// interrupted wait reports zero events rather than an error.
    pub fn wait(&self, set: &mut ReadySet, timeout: Option<Duration>) -> io::Result<usize> {
        let millis = timeout
            .map(|to| cmp::min(to.as_millis(), c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        set.raw.clear();

        let count = match syscall!(epoll_wait(
            self.fd,
            set.raw.as_mut_ptr(),
            set.raw.capacity() as c_int,
            millis
        )) {
            Ok(count) => count as usize,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        unsafe { set.raw.set_len(count) };

        Ok(count)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

/// Ready-set reused across cycles: storage is allocated once, refilled in
/// place by the wait, and iteration decodes `(Ready, Token)` pairs straight
/// off the raw events.
pub struct ReadySet {
    raw: Vec<libc::epoll_event>,
}

impl ReadySet {
    pub fn with_capacity(cap: usize) -> ReadySet {
        ReadySet {
            raw: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ready, Token)> + '_ {
        self.raw.iter().map(decode)
    }
}

fn interest_bits(interest: Ready) -> u32 {
    let mut bits = libc::EPOLLRDHUP;

    if interest.is_readable() {
        bits |= libc::EPOLLIN;
    }

    if interest.is_writable() {
        bits |= libc::EPOLLOUT;
    }

    bits as u32
}

fn decode(event: &libc::epoll_event) -> (Ready, Token) {
    let bits = event.events as c_int;
    let mut ready = Ready::empty();

    if bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready = ready | Ready::readable();
    }

    if bits & libc::EPOLLOUT != 0 {
        ready = ready | Ready::writable();
    }

    if bits & libc::EPOLLERR != 0 {
        ready = ready | Ready::error();
    }

    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        ready = ready | Ready::hup();
    }

    (ready, Token(event.u64 as usize))
}
