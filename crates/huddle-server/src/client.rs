use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use huddle_core::{ConnectionId, ServerEvent};
use huddle_presence::EventSink;
use huddle_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol;

/// One live socket as seen by the delivery side.
pub struct ClientConnection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    connected_at: Instant,
    /// Milliseconds after `connected_at` when the client was last heard from.
    last_seen_ms: AtomicU64,
    dropped: AtomicU64,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ClientConnection {
    fn new(
        id: ConnectionId,
        tx: mpsc::Sender<Arc<str>>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics,
        }
    }

    /// Queue a pre-encoded frame without waiting. Only a full queue counts as
    /// a drop; a closed one means the socket is already going away.
    pub fn send(&self, frame: Arc<str>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.counter_inc("ws_deliveries_dropped_total", &[], 1);
                }
                tracing::warn!(
                    connection_id = %self.id,
                    frame_len = frame.len(),
                    "send queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Record any sign of life (frame or pong).
    pub fn mark_alive(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    /// How long since the client was last heard from.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last)
    }

    pub fn check_alive(&self, timeout: Duration) -> bool {
        self.idle_for() < timeout
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Every connected socket, keyed by connection id.
///
/// This is the presence tracker's [`EventSink`]: events are encoded once per
/// delivery and pushed onto the bounded per-client queues.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<ClientConnection>>,
    max_send_queue: usize,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            metrics,
        }
    }

    /// Register a new socket and hand back the receiving end of its queue.
    pub fn register(&self) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<str>>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(ClientConnection::new(id.clone(), tx, self.metrics.clone()));
        let _ = self.clients.insert(id, Arc::clone(&client));
        (client, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Events dropped on full queues, summed over connected clients.
    pub fn dropped_total(&self) -> u64 {
        self.clients.iter().map(|entry| entry.value().dropped()).sum()
    }

    fn deliver(&self, to: &ConnectionId, frame: &Arc<str>) -> bool {
        let Some(client) = self.get(to) else {
            return false;
        };
        client.send(Arc::clone(frame))
    }
}

impl EventSink for ClientRegistry {
    fn send(&self, to: &ConnectionId, event: &ServerEvent) -> bool {
        protocol::encode(event).is_some_and(|frame| self.deliver(to, &frame))
    }

    fn broadcast(&self, to: &[ConnectionId], event: &ServerEvent) -> usize {
        let Some(frame) = protocol::encode(event) else {
            return 0;
        };
        to.iter().filter(|id| self.deliver(id, &frame)).count()
    }
}
