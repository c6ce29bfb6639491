mod common;

use std::io::Write;
use std::net;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quay_io::{EventRunner, SocketContext, SocketSelector};

use common::{recv_event, Recorder, TestEvent};

const WAIT: Duration = Duration::from_secs(5);

fn setup(recorder: Recorder) -> (SocketSelector, Arc<Recorder>) {
    let recorder = Arc::new(recorder);
    let runner = EventRunner::new("backpressure-test").unwrap();
    let selector = SocketSelector::new(runner, recorder.clone()).unwrap();
    (selector, recorder)
}

fn expect_accept(rx: &mpsc::Receiver<TestEvent>) {
    match recv_event(rx, WAIT) {
        TestEvent::Accept(_) => {}
        other => panic!("expected accept, got {:?}", other),
    }
}

fn expect_receive(rx: &mpsc::Receiver<TestEvent>) {
    match recv_event(rx, WAIT) {
        TestEvent::Receive(_) => {}
        other => panic!("expected receive, got {:?}", other),
    }
}

/// A full channel makes the prepare stage wait out the read timeout, warn,
/// and append anyway: bytes are delayed, never dropped.
#[test]
fn full_channel_waits_then_proceeds() {
    let (events, rx) = mpsc::channel();
    let (selector, recorder) = setup(Recorder::new(events).drain(false));

    let ctx = SocketContext::new("127.0.0.1:0".parse().unwrap())
        .with_app_channel_size(24)
        .with_read_timeout(Duration::from_millis(150));
    let server = selector.listen(ctx).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = net::TcpStream::connect(addr).unwrap();
    expect_accept(&rx);

    // first burst fits below the bound and surfaces at once
    client.write_all(&[b'A'; 16]).unwrap();
    expect_receive(&rx);

    let session = recorder.session(0);
    assert_eq!(session.app_channel().size(), 16);

    // second burst trips the predicate; nobody drains, so the wait times
    // out and the bytes land anyway
    let stalled_at = Instant::now();
    client.write_all(&[b'B'; 16]).unwrap();
    expect_receive(&rx);

    assert!(stalled_at.elapsed() >= Duration::from_millis(100));
    assert_eq!(session.app_channel().size(), 32);

    let mut buf = [0u8; 64];
    let n = session.read(&mut buf);
    assert_eq!(&buf[..n], [vec![b'A'; 16], vec![b'B'; 16]].concat().as_slice());

    selector.close();
}

/// A reader draining mid-wait releases the producer before the timeout.
#[test]
fn drain_releases_waiting_producer() {
    let (events, rx) = mpsc::channel();
    let (selector, recorder) = setup(Recorder::new(events).drain(false));

    let ctx = SocketContext::new("127.0.0.1:0".parse().unwrap())
        .with_app_channel_size(24)
        .with_read_timeout(Duration::from_secs(10));
    let server = selector.listen(ctx).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = net::TcpStream::connect(addr).unwrap();
    expect_accept(&rx);

    client.write_all(&[b'A'; 16]).unwrap();
    expect_receive(&rx);

    let session = recorder.session(0);

    // drain concurrently while the second burst is parked in prepare
    let reader = session.clone();
    let drainer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut buf = [0u8; 64];
        reader.read(&mut buf)
    });

    let stalled_at = Instant::now();
    client.write_all(&[b'B'; 16]).unwrap();
    expect_receive(&rx);

    // released well before the 10 s timeout
    assert!(stalled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(drainer.join().unwrap(), 16);

    let mut buf = [0u8; 64];
    let n = session.read(&mut buf);
    assert_eq!(&buf[..n], &[b'B'; 16]);

    selector.close();
}
