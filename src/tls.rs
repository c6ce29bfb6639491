use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::ByteChannel;
use crate::selector::SocketSelector;
use crate::session::Session;

/// Most handshakes settle in a handful of wrap/unwrap exchanges; a drive
/// that exceeds this many steps is stuck.
const HANDSHAKE_MAX_STEPS: usize = 20;

const WRAP_RETRY_YIELD: Duration = Duration::from_millis(1);

/// Handshake progress reported by the engine after every wrap/unwrap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has a handshake record to produce; wrap empty plaintext.
    NeedWrap,
    /// The engine needs inbound ciphertext; unwrap from the inbox.
    NeedUnwrap,
    /// The engine delegated work; run every task it offers, inline.
    NeedTask,
    /// The last wrap/unwrap completed the handshake.
    Finished,
    NotHandshaking,
}

/// Result status of a single wrap/unwrap call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// The destination plane cannot hold the output; retry next cycle.
    BufferOverflow,
    /// The source does not hold a complete record yet.
    BufferUnderflow,
    Closed,
}

#[derive(Copy, Clone, Debug)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    pub consumed: usize,
    pub produced: usize,
}

/// The TLS state machine the runtime drives. Implementations own all
/// cryptography; the runtime only moves bytes and reacts to the reported
/// statuses.
pub trait TlsEngine: Send {
    fn begin_handshake(&mut self) -> io::Result<()>;

    /// Encrypt `src` into `dst`, or produce a handshake record when `src`
    /// is empty.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult>;

    /// Decrypt one record from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult>;

    /// The next delegated task, if any remain.
    fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Largest record the engine will produce; sizes both plane buffers.
    fn packet_size(&self) -> usize;

    fn close_outbound(&mut self);
}

/// Builds one engine per session. Accepted sessions get a server engine,
/// connected sessions a client engine.
pub trait TlsEngineFactory: Send + Sync {
    fn server_engine(&self) -> io::Result<Box<dyn TlsEngine>>;
    fn client_engine(&self) -> io::Result<Box<dyn TlsEngine>>;
}

enum HandshakeUnwrap {
    Progress,
    /// The inbox has no complete record; resume on the next read event.
    Stalled,
}

/// Per-session TLS state machine.
///
/// Inbound ciphertext lands in the adapter's inbox channel; [`handshake`]
/// advances the engine until it reports `NotHandshaking`, after which
/// [`unwrap_channel`] pumps records into the application channel and
/// [`wrap_data`] encrypts outbound plaintext. The plane buffers live under
/// one lock together with an alive/released tag, so a release racing a
/// wrap or unwrap yields `None` instead of touching freed buffers.
///
/// [`handshake`]: TlsAdapter::handshake
/// [`unwrap_channel`]: TlsAdapter::unwrap_channel
/// [`wrap_data`]: TlsAdapter::wrap_data
pub struct TlsAdapter {
    state: Mutex<TlsState>,
    handshake_done: AtomicBool,
    net_channel: ByteChannel,
}

struct TlsState {
    engine: Box<dyn TlsEngine>,
    app_plane: Vec<u8>,
    net_plane: Vec<u8>,
    released: bool,
}

impl TlsAdapter {
    pub fn new(mut engine: Box<dyn TlsEngine>) -> io::Result<TlsAdapter> {
        engine.begin_handshake()?;
        let packet_size = engine.packet_size();

        Ok(TlsAdapter {
            state: Mutex::new(TlsState {
                engine,
                app_plane: vec![0; packet_size],
                net_plane: vec![0; packet_size],
                released: false,
            }),
            handshake_done: AtomicBool::new(false),
            net_channel: ByteChannel::new(packet_size * 4),
        })
    }

    /// Never reverts to `false` once set.
    pub fn handshake_done(&self) -> bool {
        self.handshake_done.load(Ordering::Acquire)
    }

    /// Inbox for inbound ciphertext.
    pub fn net_channel(&self) -> &ByteChannel {
        &self.net_channel
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().released
    }

    /// Advance the handshake as far as the buffered ciphertext allows.
    ///
    /// Returns with the handshake unfinished when the engine needs a record
    /// that has not arrived yet; the next read event drives it again. Errors
    /// after 20 status transitions in one drive, or when a wrap keeps
    /// failing past the read timeout.
    pub fn handshake(&self, selector: &SocketSelector, session: &Arc<Session>) -> io::Result<()> {
        if self.handshake_done() {
            return Ok(());
        }

        let read_timeout = session.context().read_timeout();
        let mut steps = 0;

        loop {
            steps += 1;
            if steps > HANDSHAKE_MAX_STEPS {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "tls handshake did not converge",
                ));
            }

            let status = {
                let state = self.state.lock().unwrap();
                if state.released {
                    return Ok(());
                }
                state.engine.handshake_status()
            };

            log::trace!("handshake step {}: {:?}", steps, status);

            match status {
                HandshakeStatus::NeedWrap => {
                    self.handshake_wrap(selector, session, read_timeout)?;
                }
                HandshakeStatus::NeedUnwrap => match self.handshake_unwrap()? {
                    HandshakeUnwrap::Progress => {}
                    HandshakeUnwrap::Stalled => return Ok(()),
                },
                HandshakeStatus::NeedTask => self.run_delegated_tasks(),
                HandshakeStatus::Finished => continue,
                HandshakeStatus::NotHandshaking => {
                    self.handshake_done.store(true, Ordering::Release);
                    log::trace!("handshake finished for {:?}", session.remote_addr());
                    return Ok(());
                }
            }
        }
    }

    /// One NEED_WRAP step. A failing engine wrap is retried after a short
    /// yield until the read timeout is spent; write failures abort at once.
    fn handshake_wrap(
        &self,
        selector: &SocketSelector,
        session: &Arc<Session>,
        read_timeout: Duration,
    ) -> io::Result<()> {
        let start = Instant::now();

        loop {
            let wrapped = {
                let mut state = self.state.lock().unwrap();
                if state.released {
                    return Ok(());
                }
                let TlsState {
                    engine, net_plane, ..
                } = &mut *state;

                engine
                    .wrap(&[], &mut net_plane[..])
                    .map(|res| net_plane[..res.produced].to_vec())
            };

            match wrapped {
                Ok(record) => {
                    if !record.is_empty() {
                        selector.write_raw(session, &record)?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    if start.elapsed() >= read_timeout {
                        return Err(e);
                    }
                    log::trace!("handshake wrap retry: {}", e);
                    thread::sleep(WRAP_RETRY_YIELD);
                }
            }
        }
    }

    /// One NEED_UNWRAP step against the inbox.
    fn handshake_unwrap(&self) -> io::Result<HandshakeUnwrap> {
        let mut guard = self.net_channel.lock();

        if guard.is_released() {
            return Ok(HandshakeUnwrap::Stalled);
        }

        if guard.readable().is_empty() {
            return Ok(HandshakeUnwrap::Stalled);
        }

        let res = {
            let mut state = self.state.lock().unwrap();
            if state.released {
                return Ok(HandshakeUnwrap::Stalled);
            }
            let TlsState {
                engine, app_plane, ..
            } = &mut *state;

            engine.unwrap(guard.readable(), &mut app_plane[..])?
        };

        guard.consume(res.consumed);
        guard.compact();

        if res.status == EngineStatus::BufferUnderflow && res.consumed == 0 {
            return Ok(HandshakeUnwrap::Stalled);
        }

        Ok(HandshakeUnwrap::Progress)
    }

    fn run_delegated_tasks(&self) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                if state.released {
                    return;
                }
                state.engine.delegated_task()
            };

            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Encrypt `plaintext` and push the produced records out through the
    /// session's raw send. Loops while the engine reports `Ok` and input
    /// remains. Returns `None` if the session disconnected mid-call or the
    /// adapter was released.
    pub fn wrap_data(
        &self,
        selector: &SocketSelector,
        session: &Arc<Session>,
        plaintext: &[u8],
    ) -> io::Result<Option<EngineResult>> {
        let mut offset = 0;
        let mut last = None;

        loop {
            if !session.is_connected() {
                return Ok(None);
            }

            let (res, record) = {
                let mut state = self.state.lock().unwrap();
                if state.released {
                    return Ok(None);
                }
                let TlsState {
                    engine, net_plane, ..
                } = &mut *state;

                let res = engine.wrap(&plaintext[offset..], &mut net_plane[..])?;
                (res, net_plane[..res.produced].to_vec())
            };

            if !record.is_empty() {
                selector.write_raw(session, &record)?;
            }

            offset += res.consumed;
            last = Some(res);

            if res.status != EngineStatus::Ok || offset >= plaintext.len() {
                return Ok(last);
            }
        }
    }

    /// Decrypt one record from `src` into the application plane, returning
    /// the engine result and the produced plaintext. `None` if the adapter
    /// was released.
    pub fn unwrap_data(&self, src: &[u8]) -> io::Result<Option<(EngineResult, Vec<u8>)>> {
        let mut state = self.state.lock().unwrap();
        if state.released {
            return Ok(None);
        }
        let TlsState {
            engine, app_plane, ..
        } = &mut *state;

        let res = engine.unwrap(src, &mut app_plane[..])?;
        Ok(Some((res, app_plane[..res.produced].to_vec())))
    }

    /// The record-decoding pump: view `net`, unwrap a record, compact,
    /// append the plaintext to `app`; repeat until the source runs dry or
    /// the engine asks to stop (overflow, underflow, closed).
    pub fn unwrap_channel(
        &self,
        session: &Arc<Session>,
        net: &ByteChannel,
        app: &ByteChannel,
    ) -> io::Result<()> {
        loop {
            let mut guard = net.lock();

            if guard.is_released() {
                if !session.is_connected() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "tls source channel released on a dead session",
                    ));
                }
                return Ok(());
            }

            let step = self.unwrap_data(guard.readable())?;

            let Some((res, plaintext)) = step else {
                // released mid-pump
                if !session.is_connected() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "tls adapter released on a dead session",
                    ));
                }
                return Ok(());
            };

            guard.consume(res.consumed);
            guard.compact();
            let drained = guard.readable().is_empty();
            drop(guard);

            if !plaintext.is_empty() {
                app.write_end(&plaintext)?;
            }

            // an engine that moved nothing cannot make progress; stop
            // rather than spin on the same bytes
            let moved = res.consumed > 0 || res.produced > 0;

            match res.status {
                EngineStatus::Ok if !drained && moved => continue,
                _ => return Ok(()),
            }
        }
    }

    /// Release both plane buffers and the inbox. Idempotent; any
    /// wrap/unwrap racing the release observes `None`.
    pub fn release(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.released {
                state.released = true;
                state.app_plane = Vec::new();
                state.net_plane = Vec::new();
                state.engine.close_outbound();
            }
        }
        self.net_channel.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Engine that xors payload bytes and never handshakes. Enough to
    /// exercise the adapter's buffer discipline.
    struct XorEngine;

    impl TlsEngine for XorEngine {
        fn begin_handshake(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
            let n = src.len().min(dst.len());
            for (d, s) in dst[..n].iter_mut().zip(src) {
                *d = s ^ 0x5a;
            }
            Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: n,
                produced: n,
            })
        }

        fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
            self.wrap(src, dst)
        }

        fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
            None
        }

        fn handshake_status(&self) -> HandshakeStatus {
            HandshakeStatus::NotHandshaking
        }

        fn packet_size(&self) -> usize {
            256
        }

        fn close_outbound(&mut self) {}
    }

    #[test]
    fn unwrap_after_release_returns_none() {
        let adapter = TlsAdapter::new(Box::new(XorEngine)).unwrap();

        adapter.release();

        assert!(adapter.unwrap_data(b"\x00\x01").unwrap().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let adapter = TlsAdapter::new(Box::new(XorEngine)).unwrap();

        adapter.release();
        adapter.release();

        assert!(adapter.is_released());
        assert!(adapter.net_channel().is_released());
    }

    #[test]
    fn unwrap_round_trips_through_planes() {
        let adapter = TlsAdapter::new(Box::new(XorEngine)).unwrap();

        let ciphertext: Vec<u8> = b"secret".iter().map(|b| b ^ 0x5a).collect();
        let (res, plaintext) = adapter.unwrap_data(&ciphertext).unwrap().unwrap();

        assert_eq!(res.consumed, 6);
        assert_eq!(plaintext, b"secret");
    }
}
