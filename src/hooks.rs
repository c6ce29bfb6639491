use std::io;
use std::sync::Arc;

use crate::channel::ByteChannel;
use crate::selector::SocketSelector;
use crate::session::Session;

/// Application-facing notifications fired by the runtime. All callbacks run
/// on the runner thread, so they may call back into the selector (send,
/// close) without extra synchronization.
pub trait EventTrigger: Send + Sync {
    fn on_accept(&self, selector: &SocketSelector, session: &Arc<Session>);

    /// Fired after a read left bytes in the session's application channel.
    fn on_receive(&self, selector: &SocketSelector, session: &Arc<Session>);

    /// Fired for errors that are not plain disconnects. The session is not
    /// closed by the runtime; the application decides.
    fn on_exception(&self, selector: &SocketSelector, session: &Arc<Session>, err: &io::Error);
}

/// Framing seam owned by the application. The runtime only asks one
/// question of it.
pub trait MessageSplitter: Send + Sync {
    /// Whether the freshly read bytes carry an in-band end-of-stream
    /// marker. Returning `true` closes the session with `StopType::StreamEnd`.
    fn is_stream_end(&self, buf: &[u8]) -> bool;
}

/// Keep-alive interception. Runs against the application channel before the
/// receive notification; may consume control frames from the front.
pub trait HeartBeat: Send + Sync {
    fn intercept(&self, session: &Arc<Session>, channel: &ByteChannel);
}
