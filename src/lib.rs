//! A non-blocking socket runtime for Rust: one selector thread multiplexes
//! many TCP and UDP sessions, with an optional TLS record-layer adapter
//! between the wire and the application-visible byte stream.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! quay-io = "0.1"
//! ```
//!
//! # Example
//!
//! An echo server:
//!
//! ```no_run
//! use std::io;
//! use std::sync::Arc;
//!
//! use quay_io::{EventRunner, EventTrigger, Session, SocketContext, SocketSelector};
//!
//! struct Echo;
//!
//! impl EventTrigger for Echo {
//!     fn on_accept(&self, _selector: &SocketSelector, session: &Arc<Session>) {
//!         println!("accepted {:?}", session.remote_addr());
//!     }
//!
//!     fn on_receive(&self, selector: &SocketSelector, session: &Arc<Session>) {
//!         let mut buf = [0u8; 4096];
//!         let n = session.read(&mut buf);
//!         let _ = selector.send(session, &buf[..n]);
//!     }
//!
//!     fn on_exception(&self, _selector: &SocketSelector, session: &Arc<Session>, err: &io::Error) {
//!         eprintln!("error on {:?}: {}", session.remote_addr(), err);
//!     }
//! }
//!
//! let runner = EventRunner::new("echo-io").unwrap();
//! let selector = SocketSelector::new(runner, Arc::new(Echo)).unwrap();
//!
//! let ctx = SocketContext::new("127.0.0.1:9000".parse().unwrap());
//! let server = selector.listen(ctx).unwrap();
//! println!("listening on {:?}", server.local_addr().unwrap());
//! ```

#[macro_use]
mod sys;

mod channel;
mod hooks;
mod prepare;
mod ready;
mod runner;
mod selector;
mod session;
mod tls;
mod token;
mod waker;

pub mod net;
pub mod queue;

pub use channel::{ByteChannel, ChannelGuard};
pub use hooks::{EventTrigger, HeartBeat, MessageSplitter};
pub use ready::Ready;
pub use runner::{EventRunner, Task};
pub use selector::SocketSelector;
pub use session::{Session, SocketContext, StopType, Transport};
pub use tls::{
    EngineResult, EngineStatus, HandshakeStatus, TlsAdapter, TlsEngine, TlsEngineFactory,
};
pub use token::Token;
pub use waker::Waker;
