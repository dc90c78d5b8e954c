use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::actor::PresenceHandle;
use crate::client::{ClientConnection, ClientRegistry};
use crate::heartbeat::{self, HeartbeatResult};
use crate::protocol;

/// How long the writer gets to flush a close frame once the connection ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Timing knobs for one socket.
#[derive(Clone, Copy, Debug)]
pub struct SocketTimings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Drive one accepted socket until it closes, times out, or `shutdown` fires.
///
/// The connection is registered for delivery before the presence actor hears
/// about it, and unregistered before the actor is told it is gone. `slot` is
/// the connection-limit permit and is released once the socket is
/// unregistered.
pub async fn serve_socket(
    socket: WebSocket,
    registry: Arc<ClientRegistry>,
    presence: PresenceHandle,
    timings: SocketTimings,
    shutdown: CancellationToken,
    slot: OwnedSemaphorePermit,
) {
    let (conn, rx) = registry.register();
    let span = tracing::info_span!("ws", connection_id = %conn.id);

    async move {
        tracing::info!("client connected");
        presence.connect(conn.id.clone()).await;

        let cancel = shutdown.child_token();
        let (ws_tx, ws_rx) = socket.split();

        let mut writer = tokio::spawn(
            run_writer(ws_tx, rx, timings.heartbeat_interval, cancel.clone())
                .in_current_span(),
        );
        let mut reader = tokio::spawn(
            run_reader(ws_rx, Arc::clone(&conn), presence.clone(), cancel.clone())
                .in_current_span(),
        );
        let mut watchdog = tokio::spawn(
            heartbeat::run_heartbeat(
                Arc::clone(&conn),
                timings.heartbeat_interval,
                timings.heartbeat_timeout,
                cancel.clone(),
            )
            .in_current_span(),
        );

        let writer_done = tokio::select! {
            _ = &mut writer => {
                tracing::debug!("writer finished");
                true
            }
            _ = &mut reader => {
                tracing::debug!("client closed the socket");
                false
            }
            result = &mut watchdog => {
                if matches!(result, Ok(HeartbeatResult::TimedOut)) {
                    tracing::info!("closing unresponsive client");
                }
                false
            }
        };

        cancel.cancel();
        reader.abort();
        watchdog.abort();
        if !writer_done {
            finish(writer).await;
        }

        registry.unregister(&conn.id);
        drop(slot);
        presence.disconnect(conn.id.clone()).await;
        tracing::info!(
            connected_secs = conn.connected_for().as_secs(),
            dropped = conn.dropped(),
            "client disconnected"
        );
    }
    .instrument(span)
    .await;
}

async fn finish(mut writer: JoinHandle<()>) {
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Drain the outbound queue to the socket and ping on every interval. Sends a
/// close frame when cancelled.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<str>>,
    ping_every: Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                tracing::trace!("sent ping");
            }
            () = cancel.cancelled() => {
                let close = CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("server closing"),
                };
                let _ = ws_tx.send(WsMessage::Close(Some(close))).await;
                break;
            }
        }
    }
}

/// Read frames until the client goes away, forwarding parsed events to the
/// presence actor in arrival order.
async fn run_reader(
    mut ws_rx: SplitStream<WebSocket>,
    conn: Arc<ClientConnection>,
    presence: PresenceHandle,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = cancel.cancelled() => break,
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "socket read failed");
                break;
            }
            None => break,
        };

        conn.mark_alive();
        match msg {
            WsMessage::Text(text) => match protocol::decode(text.as_str()) {
                Ok(event) => presence.event(conn.id.clone(), event).await,
                Err(e) => {
                    tracing::debug!(error = %e, frame_len = text.len(), "ignoring malformed frame");
                }
            },
            WsMessage::Binary(data) => {
                tracing::warn!(frame_len = data.len(), "ignoring binary frame");
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}
