mod common;

use std::io::{self, Read, Write};
use std::net;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use quay_io::{
    EngineResult, EngineStatus, EventRunner, HandshakeStatus, SocketContext, SocketSelector,
    TlsEngine, TlsEngineFactory,
};

use common::{recv_bytes, recv_event, wait_until, Recorder, TestEvent};

const WAIT: Duration = Duration::from_secs(5);

const CLIENT_HELLO: &[u8] = b"CLIENT_HELLO";
const SERVER_HELLO: &[u8] = b"SERVER_HELLO";
const MASK: u8 = 0x5a;

/// Test record layer: 2-byte big-endian length, then the payload xored
/// with a fixed mask.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend(payload.iter().map(|b| b ^ MASK));
    out
}

fn read_frame(stream: &mut net::TcpStream) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;
    let len = u16::from_be_bytes(header) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    for b in payload.iter_mut() {
        *b ^= MASK;
    }
    Ok(payload)
}

#[derive(PartialEq)]
enum Stage {
    /// Server: wait for the hello record. Client: send it.
    Hello,
    /// Server: delegated task, then answer. Client: wait for the answer.
    Answer,
    /// Handshake settled; wrap/unwrap move framed records.
    Data,
}

/// Scripted engine walking a fixed two-message handshake, then xor-framing
/// application records. Exercises every handshake status the driver knows.
struct ScriptEngine {
    server: bool,
    stage: Stage,
    task_pending: bool,
    /// The one `Finished` report, made on the first status read after the
    /// handshake settles.
    finished_reported: std::cell::Cell<bool>,
}

impl ScriptEngine {
    fn server() -> ScriptEngine {
        ScriptEngine {
            server: true,
            stage: Stage::Hello,
            task_pending: false,
            finished_reported: std::cell::Cell::new(false),
        }
    }

    fn client() -> ScriptEngine {
        ScriptEngine {
            server: false,
            stage: Stage::Hello,
            task_pending: false,
            finished_reported: std::cell::Cell::new(false),
        }
    }
}

fn result(
    status: EngineStatus,
    handshake: HandshakeStatus,
    consumed: usize,
    produced: usize,
) -> EngineResult {
    EngineResult {
        status,
        handshake,
        consumed,
        produced,
    }
}

impl TlsEngine for ScriptEngine {
    fn begin_handshake(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
        match self.stage {
            Stage::Hello if !self.server => {
                dst[..CLIENT_HELLO.len()].copy_from_slice(CLIENT_HELLO);
                self.stage = Stage::Answer;
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::NeedUnwrap,
                    0,
                    CLIENT_HELLO.len(),
                ))
            }
            Stage::Answer if self.server => {
                dst[..SERVER_HELLO.len()].copy_from_slice(SERVER_HELLO);
                self.stage = Stage::Data;
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::Finished,
                    0,
                    SERVER_HELLO.len(),
                ))
            }
            Stage::Data => {
                let room = dst.len().saturating_sub(2).min(src.len());
                let record = frame(&src[..room]);
                dst[..record.len()].copy_from_slice(&record);
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::NotHandshaking,
                    room,
                    record.len(),
                ))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "wrap out of order",
            )),
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
        match self.stage {
            Stage::Hello if self.server => {
                if src.len() < CLIENT_HELLO.len() {
                    return Ok(result(
                        EngineStatus::BufferUnderflow,
                        HandshakeStatus::NeedUnwrap,
                        0,
                        0,
                    ));
                }
                if &src[..CLIENT_HELLO.len()] != CLIENT_HELLO {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "bad hello"));
                }
                self.stage = Stage::Answer;
                self.task_pending = true;
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::NeedTask,
                    CLIENT_HELLO.len(),
                    0,
                ))
            }
            Stage::Answer if !self.server => {
                if src.len() < SERVER_HELLO.len() {
                    return Ok(result(
                        EngineStatus::BufferUnderflow,
                        HandshakeStatus::NeedUnwrap,
                        0,
                        0,
                    ));
                }
                if &src[..SERVER_HELLO.len()] != SERVER_HELLO {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "bad answer"));
                }
                self.stage = Stage::Data;
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::Finished,
                    SERVER_HELLO.len(),
                    0,
                ))
            }
            Stage::Data => {
                if src.len() < 2 {
                    return Ok(result(
                        EngineStatus::BufferUnderflow,
                        HandshakeStatus::NotHandshaking,
                        0,
                        0,
                    ));
                }
                let len = u16::from_be_bytes([src[0], src[1]]) as usize;
                if src.len() < len + 2 {
                    return Ok(result(
                        EngineStatus::BufferUnderflow,
                        HandshakeStatus::NotHandshaking,
                        0,
                        0,
                    ));
                }
                for (d, s) in dst[..len].iter_mut().zip(&src[2..2 + len]) {
                    *d = s ^ MASK;
                }
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::NotHandshaking,
                    len + 2,
                    len,
                ))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unwrap out of order",
            )),
        }
    }

    fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        if self.task_pending {
            self.task_pending = false;
            Some(Box::new(|| {}))
        } else {
            None
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.stage {
            Stage::Hello => {
                if self.server {
                    HandshakeStatus::NeedUnwrap
                } else {
                    HandshakeStatus::NeedWrap
                }
            }
            Stage::Answer => {
                if self.task_pending {
                    HandshakeStatus::NeedTask
                } else if self.server {
                    HandshakeStatus::NeedWrap
                } else {
                    HandshakeStatus::NeedUnwrap
                }
            }
            Stage::Data => {
                if self.finished_reported.replace(true) {
                    HandshakeStatus::NotHandshaking
                } else {
                    HandshakeStatus::Finished
                }
            }
        }
    }

    fn packet_size(&self) -> usize {
        1024
    }

    fn close_outbound(&mut self) {}
}

struct ScriptFactory;

impl TlsEngineFactory for ScriptFactory {
    fn server_engine(&self) -> io::Result<Box<dyn TlsEngine>> {
        Ok(Box::new(ScriptEngine::server()))
    }

    fn client_engine(&self) -> io::Result<Box<dyn TlsEngine>> {
        Ok(Box::new(ScriptEngine::client()))
    }
}

fn setup(recorder: Recorder) -> (SocketSelector, Arc<Recorder>) {
    let recorder = Arc::new(recorder);
    let runner = EventRunner::new("tls-test").unwrap();
    let selector = SocketSelector::new(runner, recorder.clone()).unwrap();
    (selector, recorder)
}

/// Server-mode handshake fed across two reads, then an encrypted echo.
#[test]
fn server_handshake_across_reads_then_echo() {
    let (events, rx) = mpsc::channel();
    let (selector, recorder) = setup(Recorder::new(events).drain(true).echo(true));

    let ctx = SocketContext::new("127.0.0.1:0".parse().unwrap()).with_tls(Arc::new(ScriptFactory));
    let server = selector.listen(ctx).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = net::TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    match recv_event(&rx, WAIT) {
        TestEvent::Accept(_) => {}
        other => panic!("expected accept, got {:?}", other),
    }

    // split the hello so the driver has to stall on BufferUnderflow and
    // resume on the next read event
    client.write_all(&CLIENT_HELLO[..7]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(&CLIENT_HELLO[7..]).unwrap();

    let mut answer = [0u8; 12];
    client.read_exact(&mut answer).unwrap();
    assert_eq!(&answer, SERVER_HELLO);

    let session = recorder.session(0);
    let adapter = session.tls().expect("session has tls");
    assert!(wait_until(|| adapter.handshake_done(), WAIT));

    // encrypted round trip through the echo trigger
    client.write_all(&frame(b"ping")).unwrap();
    assert_eq!(recv_bytes(&rx, 4, WAIT), b"ping");
    assert_eq!(read_frame(&mut client).unwrap(), b"ping");

    selector.close();
}

/// Client-mode handshake driven by the connect-time task, with application
/// data arriving in the same segment as the final handshake record.
#[test]
fn client_handshake_and_piggybacked_data() {
    let (events, rx) = mpsc::channel();
    let (selector, _recorder) = setup(Recorder::new(events).drain(true));

    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || -> io::Result<Vec<u8>> {
        let (mut stream, _) = listener.accept()?;
        stream.set_read_timeout(Some(WAIT))?;

        let mut hello = [0u8; 12];
        stream.read_exact(&mut hello)?;
        assert_eq!(&hello, CLIENT_HELLO);

        // answer and first record in one burst
        let mut burst = SERVER_HELLO.to_vec();
        burst.extend_from_slice(&frame(b"welcome"));
        stream.write_all(&burst)?;

        read_frame(&mut stream)
    });

    let ctx = SocketContext::new(addr).with_tls(Arc::new(ScriptFactory));
    let session = selector.connect(ctx).unwrap();

    assert_eq!(recv_bytes(&rx, 7, WAIT), b"welcome");

    let adapter = session.tls().expect("session has tls");
    assert!(adapter.handshake_done());

    selector.send(&session, b"thanks").unwrap();
    assert_eq!(server.join().unwrap().unwrap(), b"thanks");

    selector.close();
}

/// A handshake that never converges trips the drive bound and surfaces as
/// an exception.
#[test]
fn runaway_handshake_is_aborted() {
    struct SpinningEngine;

    impl TlsEngine for SpinningEngine {
        fn begin_handshake(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn wrap(&mut self, _src: &[u8], _dst: &mut [u8]) -> io::Result<EngineResult> {
            Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NeedWrap,
                consumed: 0,
                produced: 0,
            })
        }

        fn unwrap(&mut self, _src: &[u8], _dst: &mut [u8]) -> io::Result<EngineResult> {
            Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NeedWrap,
                consumed: 0,
                produced: 0,
            })
        }

        fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
            None
        }

        fn handshake_status(&self) -> HandshakeStatus {
            HandshakeStatus::NeedWrap
        }

        fn packet_size(&self) -> usize {
            1024
        }

        fn close_outbound(&mut self) {}
    }

    struct SpinningFactory;

    impl TlsEngineFactory for SpinningFactory {
        fn server_engine(&self) -> io::Result<Box<dyn TlsEngine>> {
            Ok(Box::new(SpinningEngine))
        }

        fn client_engine(&self) -> io::Result<Box<dyn TlsEngine>> {
            Ok(Box::new(SpinningEngine))
        }
    }

    let (events, rx) = mpsc::channel();
    let (selector, _recorder) = setup(Recorder::new(events).drain(true));

    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let keep_alive = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(2));
        drop(stream);
    });

    let ctx = SocketContext::new(addr).with_tls(Arc::new(SpinningFactory));
    let session = selector.connect(ctx).unwrap();

    match recv_event(&rx, WAIT) {
        TestEvent::Exception(kind) => assert_eq!(kind, io::ErrorKind::InvalidData),
        other => panic!("expected exception, got {:?}", other),
    }

    drop(session);
    keep_alive.join().unwrap();
    selector.close();
}
