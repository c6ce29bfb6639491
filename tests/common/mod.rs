#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quay_io::{EventTrigger, Session, SocketSelector};

#[derive(Debug)]
pub enum TestEvent {
    Accept(Option<SocketAddr>),
    Receive(Vec<u8>),
    Exception(io::ErrorKind),
}

/// Trigger that records every notification and optionally drains or echoes
/// received bytes. Accepted sessions are kept so tests can reach them.
pub struct Recorder {
    events: Mutex<Sender<TestEvent>>,
    pub sessions: Mutex<Vec<Arc<Session>>>,
    echo: bool,
    drain: bool,
}

impl Recorder {
    pub fn new(events: Sender<TestEvent>) -> Recorder {
        Recorder {
            events: Mutex::new(events),
            sessions: Mutex::new(Vec::new()),
            echo: false,
            drain: true,
        }
    }

    pub fn echo(mut self, echo: bool) -> Recorder {
        self.echo = echo;
        self
    }

    pub fn drain(mut self, drain: bool) -> Recorder {
        self.drain = drain;
        self
    }

    pub fn session(&self, idx: usize) -> Arc<Session> {
        self.sessions.lock().unwrap()[idx].clone()
    }

    fn emit(&self, event: TestEvent) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl EventTrigger for Recorder {
    fn on_accept(&self, _selector: &SocketSelector, session: &Arc<Session>) {
        self.sessions.lock().unwrap().push(session.clone());
        self.emit(TestEvent::Accept(session.remote_addr()));
    }

    fn on_receive(&self, selector: &SocketSelector, session: &Arc<Session>) {
        let bytes = if self.drain {
            let mut buf = vec![0u8; 64 * 1024];
            let n = session.read(&mut buf);
            buf.truncate(n);
            buf
        } else {
            Vec::new()
        };

        if self.echo && !bytes.is_empty() {
            let _ = selector.send(session, &bytes);
        }

        self.emit(TestEvent::Receive(bytes));
    }

    fn on_exception(&self, _selector: &SocketSelector, _session: &Arc<Session>, err: &io::Error) {
        self.emit(TestEvent::Exception(err.kind()));
    }
}

pub fn recv_event(rx: &Receiver<TestEvent>, timeout: Duration) -> TestEvent {
    rx.recv_timeout(timeout).expect("timed out waiting for event")
}

/// Accumulate drained `Receive` payloads until `want` bytes arrived.
pub fn recv_bytes(rx: &Receiver<TestEvent>, want: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut got = Vec::new();

    while got.len() < want {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out accumulating payload");

        match rx.recv_timeout(remaining) {
            Ok(TestEvent::Receive(bytes)) => got.extend_from_slice(&bytes),
            Ok(_) => {}
            Err(_) => panic!("timed out accumulating payload, have {} bytes", got.len()),
        }
    }

    got
}

pub fn wait_until<F>(cond: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    cond()
}
