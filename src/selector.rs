use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{error, trace};
use slab::Slab;

use crate::hooks::EventTrigger;
use crate::net::tcp::{TcpListener, TcpStream};
use crate::net::udp::UdpSocket;
use crate::prepare::prepare;
use crate::ready::Ready;
use crate::runner::EventRunner;
use crate::session::{Session, SocketContext, StopType, Transport};
use crate::sys;
use crate::tls::TlsAdapter;
use crate::token::Token;

/// Reserved for the runner's inbox eventfd.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Deadline for one select call. The granularity of the underlying wait is
/// coarse anyway; anything parked on the inbox eventfd interrupts it.
const SELECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Yield between cycles with nothing ready, and between stalled writes.
const IO_YIELD: Duration = Duration::from_millis(1);

const SCRATCH_SIZE: usize = 64 * 1024;

const EVENTS_CAPACITY: usize = 1024;

struct Entry {
    session: Arc<Session>,
    /// Implicit per-remote sessions of an unconnected datagram server.
    peers: IndexMap<SocketAddr, Arc<Session>>,
}

/// Readiness-driven socket multiplexer.
///
/// Owns the epoll instance, the registration table and the scratch read
/// buffer. Every cycle, registration, cancellation and write runs on the
/// [`EventRunner`] thread; callers on other threads submit a task and
/// return. The runner's inbox fd is registered under a reserved token so
/// submitting work interrupts an in-flight select.
pub struct SocketSelector {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    poller: sys::Poller,
    ready_set: Mutex<sys::ReadySet>,
    scratch: Mutex<Option<Box<[u8]>>>,
    entries: Mutex<Slab<Entry>>,
    runner: EventRunner,
    trigger: Arc<dyn EventTrigger>,
    closed: AtomicBool,
}

impl SocketSelector {
    pub fn new(runner: EventRunner, trigger: Arc<dyn EventTrigger>) -> io::Result<SocketSelector> {
        let poller = sys::Poller::new()?;
        runner.tasks().register(&poller, WAKER_TOKEN)?;

        let selector = SocketSelector {
            inner: Arc::new(SelectorInner {
                poller,
                ready_set: Mutex::new(sys::ReadySet::with_capacity(EVENTS_CAPACITY)),
                scratch: Mutex::new(Some(vec![0u8; SCRATCH_SIZE].into_boxed_slice())),
                entries: Mutex::new(Slab::new()),
                runner,
                trigger,
                closed: AtomicBool::new(false),
            }),
        };

        let weak = Arc::downgrade(&selector.inner);
        selector.inner.runner.set_cycle(move |runner| {
            if let Some(inner) = weak.upgrade() {
                let selector = SocketSelector { inner };
                let _ = runner.add_event(move |runner| selector.event_cycle(runner));
            }
        });

        selector.inner.runner.schedule_cycle();

        Ok(selector)
    }

    pub fn runner(&self) -> &EventRunner {
        &self.inner.runner
    }

    /// Bind a TCP server and register it for accepts.
    pub fn listen(&self, ctx: SocketContext) -> io::Result<Arc<Session>> {
        let listener = TcpListener::bind(ctx.addr())?;
        let session = Arc::new(Session::new(
            Transport::Listener(listener),
            None,
            Arc::new(ctx),
            None,
        ));

        self.register(&session, Ready::readable())?;

        Ok(session)
    }

    /// Connect a TCP client session. With a TLS factory present the
    /// handshake drive starts as soon as the registration lands.
    pub fn connect(&self, ctx: SocketContext) -> io::Result<Arc<Session>> {
        let stream = TcpStream::connect(ctx.addr())?;
        let remote = stream.peer_addr()?;
        let ctx = Arc::new(ctx);

        let tls = match ctx.tls() {
            Some(factory) => Some(TlsAdapter::new(factory.client_engine()?)?),
            None => None,
        };

        let session = Arc::new(Session::new(Transport::Stream(stream), Some(remote), ctx, tls));

        self.register(&session, Ready::readable())?;

        if session.tls().is_some() {
            let selector = self.clone();
            let driven = session.clone();
            self.inner.runner.add_event(move |_| {
                if let Some(tls) = driven.tls() {
                    if let Err(e) = tls.handshake(&selector, &driven) {
                        driven.set_stop(StopType::Error);
                        selector.close_session(&driven);
                        selector.deal_exception(&driven, e);
                    }
                }
                true
            })?;
        }

        Ok(session)
    }

    /// Bind an unconnected UDP server; peers get implicit sessions on
    /// first sight.
    pub fn udp_bind(&self, ctx: SocketContext) -> io::Result<Arc<Session>> {
        let sock = UdpSocket::bind(ctx.addr())?;
        let session = Arc::new(Session::new(
            Transport::Datagram(sock),
            None,
            Arc::new(ctx),
            None,
        ));

        self.register(&session, Ready::readable())?;

        Ok(session)
    }

    /// A connected UDP client session.
    pub fn udp_connect(&self, ctx: SocketContext) -> io::Result<Arc<Session>> {
        let local = if ctx.addr().is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let sock = UdpSocket::bind(local)?;
        sock.connect(ctx.addr())?;
        let remote = ctx.addr();

        let session = Arc::new(Session::new(
            Transport::Datagram(sock),
            Some(remote),
            Arc::new(ctx),
            None,
        ));

        self.register(&session, Ready::readable())?;

        Ok(session)
    }

    /// Install `session` in the selector with the requested interest.
    /// Executes immediately on the runner thread, otherwise as a task.
    pub fn register(&self, session: &Arc<Session>, interest: Ready) -> io::Result<()> {
        if self.inner.runner.on_runner_thread() {
            self.register_now(session, interest)
        } else {
            let selector = self.clone();
            let session = session.clone();
            self.inner.runner.add_event(move |_| {
                if let Err(e) = selector.register_now(&session, interest) {
                    selector.deal_exception(&session, e);
                }
                true
            })
        }
    }

    fn register_now(&self, session: &Arc<Session>, interest: Ready) -> io::Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "selector closed"));
        }

        let fd = session.transport().as_raw_fd();
        let token = {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.insert(Entry {
                session: session.clone(),
                peers: IndexMap::new(),
            })
        };

        match self.inner.poller.add(fd, Token(token), interest) {
            Ok(()) => {
                session.set_token(Token(token));
                trace!("registered fd {} as {:?}", fd, Token(token));
                Ok(())
            }
            Err(e) => {
                // closed or otherwise unregistrable channel
                self.inner.entries.lock().unwrap().try_remove(token);
                Err(e)
            }
        }
    }

    /// Remove the registration. Enqueued from any thread; the attachment is
    /// dropped before the epoll key so readiness iteration never sees a
    /// freed session.
    pub fn unregister(&self, session: &Arc<Session>) {
        let selector = self.clone();
        let session = session.clone();
        let _ = self.inner.runner.add_event(move |_| {
            selector.unregister_now(&session);
            true
        });
    }

    fn unregister_now(&self, session: &Arc<Session>) {
        let Some(token) = session.take_token() else {
            return;
        };

        let entry = {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.try_remove(token.0)
        };

        if let Some(entry) = entry {
            let fd = entry.session.transport().as_raw_fd();
            let _ = self.inner.poller.remove(fd);
            trace!("unregistered fd {} from {:?}", fd, token);
        }
    }

    /// Send application bytes: wrapped through the session's TLS adapter
    /// when one is active, raw otherwise. On the runner thread the bounded
    /// write happens inline and its result is returned; other threads
    /// enqueue the send and see failures through `on_exception`.
    pub fn send(&self, session: &Arc<Session>, buf: &[u8]) -> io::Result<usize> {
        if self.inner.runner.on_runner_thread() {
            self.send_now(session, buf)
        } else {
            let selector = self.clone();
            let session = session.clone();
            let data = buf.to_vec();
            self.inner.runner.add_event(move |_| {
                if let Err(e) = selector.send_now(&session, &data) {
                    selector.deal_exception(&session, e);
                }
                true
            })?;
            Ok(buf.len())
        }
    }

    fn send_now(&self, session: &Arc<Session>, buf: &[u8]) -> io::Result<usize> {
        match session.tls() {
            Some(tls) if tls.handshake_done() => match tls.wrap_data(self, session, buf)? {
                Some(_) => Ok(buf.len()),
                None => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "session went away during tls wrap",
                )),
            },
            Some(_) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "tls handshake in progress",
            )),
            None => self.write_raw(session, buf),
        }
    }

    /// Bounded-blocking send loop against the raw transport. Progress
    /// resets the deadline; a full send timeout without progress closes the
    /// session. Runner thread only.
    pub(crate) fn write_raw(&self, session: &Arc<Session>, buf: &[u8]) -> io::Result<usize> {
        debug_assert!(self.inner.runner.on_runner_thread());

        let timeout = session.context().send_timeout();
        let mut sent = 0;
        let mut start = Instant::now();

        while sent < buf.len() {
            if !session.is_connected() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "session disconnected during write",
                ));
            }

            match session.transport().write(&buf[sent..]) {
                Ok(0) => {}
                Ok(n) => {
                    sent += n;
                    start = Instant::now();
                    continue;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if start.elapsed() >= timeout {
                error!(
                    "write made no progress for {:?}, closing {:?}",
                    timeout,
                    session.remote_addr()
                );
                session.set_stop(StopType::Timeout);
                self.close_session(session);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "send timeout"));
            }

            thread::sleep(IO_YIELD);
        }

        Ok(sent)
    }

    /// Tear a session down: mark it stopped, release its channels, shut
    /// the socket and drop the registration. Idempotent.
    pub fn close_session(&self, session: &Arc<Session>) {
        if !session.mark_disconnected() {
            return;
        }

        session.set_stop(StopType::LocalClose);

        if let Some(tls) = session.tls() {
            tls.release();
        }
        session.app_channel().release();
        session.transport().shutdown();

        self.unregister(session);
    }

    /// Release the scratch buffer, drop every registration and shut the
    /// runner down. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        *self.inner.scratch.lock().unwrap() = None;

        let entries: Vec<Entry> = {
            let mut slab = self.inner.entries.lock().unwrap();
            slab.drain().collect()
        };

        for entry in entries {
            let _ = self
                .inner
                .poller
                .remove(entry.session.transport().as_raw_fd());
            self.release_session(&entry.session);
            for (_, peer) in entry.peers {
                self.release_session(&peer);
            }
        }

        let _ = self.inner.runner.tasks().deregister(&self.inner.poller);
        self.inner.runner.close();
    }

    fn release_session(&self, session: &Arc<Session>) {
        session.mark_disconnected();
        session.set_stop(StopType::LocalClose);
        if let Some(tls) = session.tls() {
            tls.release();
        }
        session.app_channel().release();
        session.transport().shutdown();
        session.take_token();
    }

    /// One iteration of the event cycle. Runs as a runner task; the `true`
    /// return re-arms the next cycle through the runner's cycle hook, even
    /// when an individual key misbehaved.
    fn event_cycle(&self, runner: &EventRunner) -> bool {
        if self.inner.closed.load(Ordering::Acquire) || runner.is_closed() {
            return false;
        }

        let mut ready_set = self.inner.ready_set.lock().unwrap();
        let count = match self.inner.poller.wait(&mut ready_set, Some(SELECT_TIMEOUT)) {
            Ok(count) => count,
            Err(e) => {
                error!("selector wait failed: {}", e);
                0
            }
        };

        if count == 0 {
            drop(ready_set);
            thread::sleep(IO_YIELD);
            return true;
        }

        for (readiness, token) in ready_set.iter() {
            if token == WAKER_TOKEN {
                // inbox tasks drain in the runner loop right after this
                continue;
            }

            self.dispatch(token, readiness);
        }

        true
    }

    fn dispatch(&self, token: Token, readiness: Ready) {
        let session = {
            let entries = self.inner.entries.lock().unwrap();
            entries.get(token.0).map(|entry| entry.session.clone())
        };

        // canceled between select and dispatch
        let Some(session) = session else {
            return;
        };

        let result = match session.transport() {
            Transport::Listener(_) => self.accept_ready(&session),
            Transport::Stream(_) => self.tcp_read(&session),
            Transport::Datagram(_) => self.udp_read(token, &session),
            Transport::DatagramPeer(..) => Ok(()),
        };

        if let Err(e) = result {
            trace!("dispatch error on {:?} ({:?}): {}", token, readiness, e);
            self.deal_exception(&session, e);
        }
    }

    fn accept_ready(&self, server: &Arc<Session>) -> io::Result<()> {
        let Transport::Listener(listener) = server.transport() else {
            return Ok(());
        };

        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        let ctx = server.context().clone();
        let tls = match ctx.tls() {
            Some(factory) => Some(TlsAdapter::new(factory.server_engine()?)?),
            None => None,
        };

        let session = Arc::new(Session::new(Transport::Stream(stream), Some(addr), ctx, tls));
        self.register_now(&session, Ready::readable())?;
        self.fire_accept(&session);

        Ok(())
    }

    fn tcp_read(&self, session: &Arc<Session>) -> io::Result<()> {
        let mut slot = self.inner.scratch.lock().unwrap();
        let Some(scratch) = slot.as_mut() else {
            return Ok(());
        };

        let n = match session.transport().read(&mut scratch[..]) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        if n == 0 {
            prepare(self, session, None)
        } else {
            prepare(self, session, Some(&scratch[..n]))
        }
    }

    fn udp_read(&self, token: Token, session: &Arc<Session>) -> io::Result<()> {
        let mut slot = self.inner.scratch.lock().unwrap();
        let Some(scratch) = slot.as_mut() else {
            return Ok(());
        };

        if session.remote_addr().is_some() {
            // connected socket: bytes come without an address
            let n = match session.transport().read(&mut scratch[..]) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            return prepare(self, session, Some(&scratch[..n]));
        }

        let Transport::Datagram(sock) = session.transport() else {
            return Ok(());
        };

        let (n, addr) = match sock.recv_from(&mut scratch[..]) {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        let peer = self.udp_peer(token, session, addr)?;
        prepare(self, &peer, Some(&scratch[..n]))
    }

    /// Look up or create the implicit session for a datagram sender.
    fn udp_peer(
        &self,
        token: Token,
        server: &Arc<Session>,
        addr: SocketAddr,
    ) -> io::Result<Arc<Session>> {
        {
            let entries = self.inner.entries.lock().unwrap();
            if let Some(entry) = entries.get(token.0) {
                if let Some(peer) = entry.peers.get(&addr) {
                    if peer.is_connected() {
                        return Ok(peer.clone());
                    }
                }
            }
        }

        let Transport::Datagram(sock) = server.transport() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a datagram server",
            ));
        };

        let peer = Arc::new(Session::new(
            Transport::DatagramPeer(sock.try_clone()?, addr),
            Some(addr),
            server.context().clone(),
            None,
        ));

        {
            let mut entries = self.inner.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(token.0) {
                entry.peers.insert(addr, peer.clone());
            }
        }

        self.fire_accept(&peer);

        Ok(peer)
    }

    /// Single funnel for per-session I/O failures. Disconnect-shaped errors
    /// close the session silently; a write timeout was already handled by
    /// the bounded write; everything else reaches the application.
    pub(crate) fn deal_exception(&self, session: &Arc<Session>, err: io::Error) {
        if is_disconnect(&err) {
            trace!("peer went away {:?}: {}", session.remote_addr(), err);
            session.set_stop(StopType::Reset);
            self.close_session(session);
            return;
        }

        if err.kind() == io::ErrorKind::TimedOut {
            return;
        }

        session.set_stop(StopType::Error);
        self.inner.trigger.on_exception(self, session, &err);
    }

    pub(crate) fn fire_accept(&self, session: &Arc<Session>) {
        self.inner.trigger.on_accept(self, session);
    }

    pub(crate) fn fire_receive(&self, session: &Arc<Session>) {
        self.inner.trigger.on_receive(self, session);
    }
}

impl Clone for SocketSelector {
    fn clone(&self) -> SocketSelector {
        SocketSelector {
            inner: self.inner.clone(),
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    ) || {
        // fallback for platform errors surfaced as Other; message matching
        // is locale-dependent, kinds above are the primary signal
        let msg = err.to_string();
        msg.contains("Broken pipe") || msg.contains("Connection reset by peer")
    }
}
