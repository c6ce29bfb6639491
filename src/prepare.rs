use std::sync::Arc;

use log::warn;

use crate::selector::SocketSelector;
use crate::session::{Session, StopType};

/// Route one read's worth of scratch-buffer bytes into the session.
///
/// `data` is `None` when the read hit end-of-stream. Order of business:
/// end-of-stream check, backpressure, TLS (handshake or record pump) or
/// plain append, heartbeat interception, receive notification. I/O errors
/// propagate to the selector's exception path; a backpressure timeout only
/// logs and proceeds, so bytes are never dropped.
pub(crate) fn prepare(
    selector: &SocketSelector,
    session: &Arc<Session>,
    data: Option<&[u8]>,
) -> std::io::Result<()> {
    let stream_end = match data {
        None => true,
        Some(buf) => session
            .context()
            .splitter()
            .map(|s| s.is_stream_end(buf))
            .unwrap_or(false),
    };

    if stream_end || !session.is_connected() {
        session.set_stop(StopType::StreamEnd);
        selector.close_session(session);
        return Ok(());
    }

    let buf = data.unwrap_or(&[]);
    let app = session.app_channel();

    if app.would_overflow(buf.len()) {
        let timeout = session.context().read_timeout();
        if !app.wait_space(buf.len(), timeout) {
            warn!(
                "application channel full for {:?}, proceeding after {:?}",
                session.remote_addr(),
                timeout
            );
        }
    }

    match session.tls() {
        Some(adapter) if !adapter.handshake_done() => {
            adapter.net_channel().write_end(buf)?;
            if let Err(e) = adapter.handshake(selector, session) {
                session.set_stop(StopType::Error);
                selector.close_session(session);
                return Err(e);
            }

            // ciphertext that followed the final handshake record
            if adapter.handshake_done() && !adapter.net_channel().is_empty() {
                adapter.unwrap_channel(session, adapter.net_channel(), app)?;
            }
        }
        Some(adapter) => {
            adapter.net_channel().write_end(buf)?;
            adapter.unwrap_channel(session, adapter.net_channel(), app)?;
        }
        None => {
            app.write_end(buf)?;
        }
    }

    if let Some(heartbeat) = session.context().heartbeat() {
        heartbeat.intercept(session, app);
        app.compact();
    }

    if !app.is_empty() {
        selector.fire_receive(session);
    }

    Ok(())
}
