//! The task that owns the presence tracker.
//!
//! Socket readers and HTTP handlers talk to it through [`PresenceHandle`];
//! every mutation runs on this one task, in arrival order.

use std::sync::Arc;

use huddle_core::{ClientEvent, ConnectionId};
use huddle_presence::{EventSink, OutgoingMessage, PresenceTracker, RoomSummary};
use huddle_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

enum PresenceCommand {
    Connect(ConnectionId),
    Event(ConnectionId, ClientEvent),
    Disconnect(ConnectionId),
    Rooms(oneshot::Sender<Vec<RoomSummary>>),
    Stats(oneshot::Sender<PresenceStats>),
    Reset,
}

/// Point-in-time counts for the health endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStats {
    pub connections: usize,
    pub rooms: usize,
}

/// Cloneable sender side of the presence actor.
///
/// Once the actor has stopped, commands are discarded and queries return
/// empty answers.
#[derive(Clone)]
pub struct PresenceHandle {
    tx: mpsc::Sender<PresenceCommand>,
}

impl PresenceHandle {
    pub async fn connect(&self, id: ConnectionId) {
        self.submit(PresenceCommand::Connect(id)).await;
    }

    pub async fn event(&self, id: ConnectionId, event: ClientEvent) {
        self.submit(PresenceCommand::Event(id, event)).await;
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        self.submit(PresenceCommand::Disconnect(id)).await;
    }

    /// Drop all presence state without notifying anyone.
    pub async fn reset(&self) {
        self.submit(PresenceCommand::Reset).await;
    }

    /// Occupied rooms, sorted by room id.
    pub async fn rooms(&self) -> Vec<RoomSummary> {
        let (reply, rx) = oneshot::channel();
        self.submit(PresenceCommand::Rooms(reply)).await;
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> PresenceStats {
        let (reply, rx) = oneshot::channel();
        self.submit(PresenceCommand::Stats(reply)).await;
        rx.await.unwrap_or_default()
    }

    async fn submit(&self, cmd: PresenceCommand) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("presence actor stopped, command discarded");
        }
    }
}

/// Spawn the actor. It runs until `cancel` fires or every handle is dropped.
pub fn spawn_presence_actor<S>(
    sink: S,
    metrics: Option<Arc<MetricsRecorder>>,
    queue: usize,
    cancel: CancellationToken,
) -> (PresenceHandle, tokio::task::JoinHandle<()>)
where
    S: EventSink + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(queue);
    let mut actor = PresenceActor {
        tracker: PresenceTracker::new(sink),
        metrics,
    };

    let task = tokio::spawn(async move {
        tracing::info!("presence actor started");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => actor.handle(cmd),
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        tracing::info!(
            connections = actor.tracker.connection_count(),
            rooms = actor.tracker.room_count(),
            "presence actor stopped"
        );
    });

    (PresenceHandle { tx }, task)
}

struct PresenceActor<S> {
    tracker: PresenceTracker<S>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl<S: EventSink> PresenceActor<S> {
    fn handle(&mut self, cmd: PresenceCommand) {
        match cmd {
            PresenceCommand::Connect(id) => {
                if self.tracker.connect(id) {
                    self.count("presence_connects_total");
                }
            }
            PresenceCommand::Event(id, event) => self.apply(&id, event),
            PresenceCommand::Disconnect(id) => {
                if self.tracker.disconnect(&id) {
                    self.count("presence_disconnects_total");
                }
            }
            PresenceCommand::Rooms(reply) => {
                let _ = reply.send(self.tracker.rooms());
                return;
            }
            PresenceCommand::Stats(reply) => {
                let _ = reply.send(PresenceStats {
                    connections: self.tracker.connection_count(),
                    rooms: self.tracker.room_count(),
                });
                return;
            }
            PresenceCommand::Reset => {
                tracing::warn!(
                    connections = self.tracker.connection_count(),
                    "presence state reset"
                );
                self.tracker.reset();
            }
        }
        self.update_gauges();
    }

    fn apply(&mut self, id: &ConnectionId, event: ClientEvent) {
        tracing::debug!(connection_id = %id, event = event.event_name(), "client event");
        match event {
            ClientEvent::JoinRoom { room_id, username } => {
                if self.tracker.join_room(id, &room_id, username) {
                    self.count("presence_joins_total");
                }
            }
            ClientEvent::LeaveRoom { room_id } => {
                if self.tracker.leave_room(id, &room_id) {
                    self.count("presence_leaves_total");
                }
            }
            ClientEvent::SendMessage {
                room_id,
                content,
                sender,
                id: message_id,
                created_at,
            } => {
                let message = OutgoingMessage {
                    room_id,
                    content,
                    sender,
                    id: message_id,
                    created_at,
                };
                if self.tracker.send_message(id, message) {
                    self.count("presence_messages_total");
                } else {
                    self.count("presence_messages_dropped_total");
                }
            }
            ClientEvent::SetUsername { username, .. } => {
                if self.tracker.set_display_name(id, username) {
                    self.count("presence_renames_total");
                }
            }
        }
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(name, &[], 1);
        }
    }

    fn update_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set("presence_connections", &[], self.tracker.connection_count() as f64);
            metrics.gauge_set("presence_rooms", &[], self.tracker.room_count() as f64);
        }
    }
}
