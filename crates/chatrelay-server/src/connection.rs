//! Per-connection supervision: one reader task running requests in order,
//! one writer task draining the outbound queue, and cleanup on every exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::frame::{self, FrameError, FrameReader, FrameWriter, IdleRead};
use crate::handlers::{self, HandlerState};
use crate::rpc::{self, Response};
use crate::server::ServerConfig;
use crate::session::ConnectionHandle;

/// How long queued frames get to reach the socket after the reader stops.
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    IdleTimeout,
    Transport(FrameError),
    /// The writer stopped, so responses can no longer be sent.
    WriterGone,
    HandlerFailed,
}

/// Serve one accepted stream until it closes, then drop its session.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<HandlerState>,
    config: Arc<ServerConfig>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (handle, outbound) = ConnectionHandle::channel();
    let span = info_span!(
        "connection",
        conn_id = %handle.id(),
        %peer,
        user_id = tracing::field::Empty,
    );
    supervise(stream, handle, outbound, state, config)
        .instrument(span)
        .await;
}

async fn supervise<S>(
    stream: S,
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<HandlerState>,
    config: Arc<ServerConfig>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!("client connected");
    let conn_id = handle.id().clone();
    let (read_half, write_half) = tokio::io::split(stream);
    let read_half = IdleRead::new(read_half, config.idle_timeout);
    let reader = frame::reader(read_half, config.max_frame_len);
    let writer = frame::writer(write_half, config.max_frame_len);

    let writer_task = tokio::spawn(write_loop(writer, outbound).in_current_span());
    let reader_task =
        tokio::spawn(read_loop(reader, handle, Arc::clone(&state), config).in_current_span());

    let reason = match reader_task.await {
        Ok(reason) => reason,
        Err(e) => {
            error!(error = %e, "connection task failed");
            CloseReason::HandlerFailed
        }
    };

    let user_id = state.registry.unbind(&conn_id);

    // The reader's handle is gone and unbind released the registry's copy,
    // so the writer finishes once it has flushed what is queued.
    let abort = writer_task.abort_handle();
    if tokio::time::timeout(WRITER_GRACE, writer_task).await.is_err() {
        debug!("writer did not drain in time");
        abort.abort();
    }

    match &reason {
        CloseReason::PeerClosed => info!(user_id = ?user_id, "client disconnected"),
        other => info!(user_id = ?user_id, reason = ?other, "connection closed"),
    }
}

async fn read_loop<R>(
    mut reader: FrameReader<IdleRead<R>>,
    conn: ConnectionHandle,
    state: Arc<HandlerState>,
    config: Arc<ServerConfig>,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        // Time spent handling the previous request does not count as idle.
        reader.get_mut().rearm();
        let payload = match frame::read_frame(&mut reader).await {
            Ok(payload) => payload,
            Err(FrameError::Closed) => return CloseReason::PeerClosed,
            Err(FrameError::Idle) => return CloseReason::IdleTimeout,
            Err(e) => return CloseReason::Transport(e),
        };

        let (response, fatal) = match rpc::parse_request(&payload) {
            Err(resp) => {
                debug!(len = payload.len(), "undecodable request");
                (resp, false)
            }
            Ok(request) => {
                debug!(action = %request.action, len = payload.len(), "request received");
                run_handler(&state, &conn, request).await
            }
        };

        if !config.response_delay.is_zero() {
            tokio::time::sleep(config.response_delay).await;
        }

        let sent = match response.to_bytes() {
            Ok(bytes) => conn.send(Bytes::from(bytes)),
            Err(e) => {
                error!(error = %e, "response encoding failed");
                conn.send(Bytes::from_static(
                    br#"{"status":"error","message":"internal server error"}"#,
                ))
            }
        };
        if fatal {
            return CloseReason::HandlerFailed;
        }
        if !sent {
            return CloseReason::WriterGone;
        }
    }
}

/// Run a handler on the blocking pool. A panicking handler yields an error
/// response and marks the connection for closing.
async fn run_handler(
    state: &Arc<HandlerState>,
    conn: &ConnectionHandle,
    request: rpc::Request,
) -> (Response, bool) {
    let state = Arc::clone(state);
    let conn = conn.clone();
    let span = Span::current();
    let result = tokio::task::spawn_blocking(move || {
        span.in_scope(|| handlers::dispatch(&state, &conn, &request))
    })
    .await;
    match result {
        Ok(response) => (response, false),
        Err(e) => {
            error!(error = %e, "handler failed");
            (Response::error(rpc::INTERNAL_ERROR), true)
        }
    }
}

async fn write_loop<W>(mut writer: FrameWriter<W>, mut outbound: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let len = frame.len();
        if let Err(e) = frame::write_frame(&mut writer, frame).await {
            debug!(error = %e, len, "write failed");
            // Closing makes later routing attempts fall back to the mailbox.
            outbound.close();
            return;
        }
    }
    if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
        debug!(error = %e, "shutdown failed");
    }
}
