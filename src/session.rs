use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::ByteChannel;
use crate::hooks::{HeartBeat, MessageSplitter};
use crate::net::tcp::{TcpListener, TcpStream};
use crate::net::udp::UdpSocket;
use crate::tls::{TlsAdapter, TlsEngineFactory};
use crate::token::Token;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHANNEL_SIZE: usize = 1024 * 1024;

pub(crate) const INVALID_TOKEN: usize = usize::MAX;

/// Why a session ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopType {
    Running,
    /// The peer finished the stream, or the splitter saw its end marker.
    StreamEnd,
    /// The peer reset or the pipe broke mid-stream.
    Reset,
    /// A bounded write made no progress for the whole send timeout.
    Timeout,
    /// Closed from this side.
    LocalClose,
    Error,
}

impl StopType {
    fn from_u8(val: u8) -> StopType {
        match val {
            1 => StopType::StreamEnd,
            2 => StopType::Reset,
            3 => StopType::Timeout,
            4 => StopType::LocalClose,
            5 => StopType::Error,
            _ => StopType::Running,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StopType::Running => 0,
            StopType::StreamEnd => 1,
            StopType::Reset => 2,
            StopType::Timeout => 3,
            StopType::LocalClose => 4,
            StopType::Error => 5,
        }
    }
}

/// The socket behind a session.
#[derive(Debug)]
pub enum Transport {
    Listener(TcpListener),
    Stream(TcpStream),
    /// A datagram socket, connected (client) or unconnected (server).
    Datagram(UdpSocket),
    /// Implicit per-remote session sharing an unconnected server socket.
    DatagramPeer(UdpSocket, SocketAddr),
}

impl Transport {
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;

        match self {
            Transport::Listener(l) => l.as_raw_fd(),
            Transport::Stream(s) => s.as_raw_fd(),
            Transport::Datagram(s) => s.as_raw_fd(),
            Transport::DatagramPeer(s, _) => s.as_raw_fd(),
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Stream(s) => (&*s).read(buf),
            Transport::Datagram(s) => s.recv(buf),
            Transport::DatagramPeer(s, _) => s.recv(buf),
            Transport::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read from a listener",
            )),
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Stream(s) => (&*s).write(buf),
            Transport::Datagram(s) => s.send(buf),
            Transport::DatagramPeer(s, addr) => s.send_to(buf, *addr),
            Transport::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to a listener",
            )),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Transport::Listener(l) => l.local_addr(),
            Transport::Stream(s) => s.local_addr(),
            Transport::Datagram(s) => s.local_addr(),
            Transport::DatagramPeer(s, _) => s.local_addr(),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Transport::Stream(s) = self {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// Configuration and addressing for a socket. Immutable once a session is
/// built from it; shared by a server session and all of its children.
pub struct SocketContext {
    addr: SocketAddr,
    read_timeout: Duration,
    send_timeout: Duration,
    app_channel_size: usize,
    tls: Option<Arc<dyn TlsEngineFactory>>,
    splitter: Option<Arc<dyn MessageSplitter>>,
    heartbeat: Option<Arc<dyn HeartBeat>>,
}

impl SocketContext {
    pub fn new(addr: SocketAddr) -> SocketContext {
        SocketContext {
            addr,
            read_timeout: DEFAULT_READ_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            app_channel_size: DEFAULT_CHANNEL_SIZE,
            tls: None,
            splitter: None,
            heartbeat: None,
        }
    }

    /// Bounds handshake wrap retries and the backpressure wait.
    pub fn with_read_timeout(mut self, timeout: Duration) -> SocketContext {
        self.read_timeout = timeout;
        self
    }

    /// Bounds a single bounded-write loop without progress.
    pub fn with_send_timeout(mut self, timeout: Duration) -> SocketContext {
        self.send_timeout = timeout;
        self
    }

    /// Capacity used by the backpressure predicate on the application
    /// channel.
    pub fn with_app_channel_size(mut self, size: usize) -> SocketContext {
        self.app_channel_size = size;
        self
    }

    /// When present, every accepted or connected session gets a TLS
    /// adapter from this factory.
    pub fn with_tls(mut self, factory: Arc<dyn TlsEngineFactory>) -> SocketContext {
        self.tls = Some(factory);
        self
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn MessageSplitter>) -> SocketContext {
        self.splitter = Some(splitter);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartBeat>) -> SocketContext {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn app_channel_size(&self) -> usize {
        self.app_channel_size
    }

    pub fn tls(&self) -> Option<&Arc<dyn TlsEngineFactory>> {
        self.tls.as_ref()
    }

    pub fn splitter(&self) -> Option<&Arc<dyn MessageSplitter>> {
        self.splitter.as_ref()
    }

    pub fn heartbeat(&self) -> Option<&Arc<dyn HeartBeat>> {
        self.heartbeat.as_ref()
    }
}

/// One logical connection: the socket, its configuration, the
/// application-facing read channel, and the optional TLS adapter. Shared as
/// `Arc`; all mutation happens through atomics or the channels' own locks,
/// and the selector drives I/O on the runner thread only.
pub struct Session {
    transport: Transport,
    remote: Option<SocketAddr>,
    ctx: Arc<SocketContext>,
    app_channel: ByteChannel,
    tls: Option<TlsAdapter>,
    token: AtomicUsize,
    connected: AtomicBool,
    stop: AtomicU8,
}

impl Session {
    pub(crate) fn new(
        transport: Transport,
        remote: Option<SocketAddr>,
        ctx: Arc<SocketContext>,
        tls: Option<TlsAdapter>,
    ) -> Session {
        let app_channel = ByteChannel::new(ctx.app_channel_size());

        Session {
            transport,
            remote,
            ctx,
            app_channel,
            tls,
            token: AtomicUsize::new(INVALID_TOKEN),
            connected: AtomicBool::new(true),
            stop: AtomicU8::new(StopType::Running.as_u8()),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn context(&self) -> &Arc<SocketContext> {
        &self.ctx
    }

    /// The bounded channel carrying decrypted, heartbeat-filtered bytes.
    pub fn app_channel(&self) -> &ByteChannel {
        &self.app_channel
    }

    pub fn tls(&self) -> Option<&TlsAdapter> {
        self.tls.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stop_type(&self) -> StopType {
        StopType::from_u8(self.stop.load(Ordering::Acquire))
    }

    /// Drain up to `dst.len()` bytes from the application channel, freeing
    /// capacity for the backpressure predicate.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.app_channel.read(dst)
    }

    /// First cause wins; later stop reasons do not overwrite it.
    pub(crate) fn set_stop(&self, stop: StopType) {
        let _ = self.stop.compare_exchange(
            StopType::Running.as_u8(),
            stop.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Returns whether the session was still connected.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Release);
    }

    pub(crate) fn take_token(&self) -> Option<Token> {
        match self.token.swap(INVALID_TOKEN, Ordering::AcqRel) {
            INVALID_TOKEN => None,
            val => Some(Token(val)),
        }
    }
}
