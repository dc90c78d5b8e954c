//! Liveness watchdog for one socket.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::ClientConnection;

/// Why the watchdog returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing heard from the client for the whole timeout window.
    TimedOut,
    Cancelled,
}

/// Check the connection every `interval` and give up once it has been idle
/// for `timeout`. Pings themselves are sent by the socket writer; any frame
/// or pong the reader sees counts as activity.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !connection.check_alive(timeout) {
                    tracing::info!(
                        connection_id = %connection.id,
                        idle_secs = connection.idle_for().as_secs(),
                        "heartbeat timed out"
                    );
                    return HeartbeatResult::TimedOut;
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
