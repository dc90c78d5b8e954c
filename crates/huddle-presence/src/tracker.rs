use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use huddle_core::{ChatMessage, ConnectionId, RoomId, ServerEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sink::EventSink;

/// Display name used until a client supplies one.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// What the tracker knows about one live connection.
#[derive(Clone, Debug)]
struct Connection {
    display_name: String,
    room: Option<RoomId>,
}

impl Connection {
    fn new() -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            room: None,
        }
    }
}

/// A chat message a connection wants relayed to its room.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub room_id: RoomId,
    pub content: String,
    pub sender: String,
    /// Id assigned by whoever persisted the message, if anyone did.
    pub id: Option<String>,
    /// Defaults to the relay time when absent.
    pub created_at: Option<DateTime<Utc>>,
}

/// Occupancy of one room at the time of the snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub online_count: usize,
}

/// Connection table plus room membership map.
///
/// Invariants, held after every public call:
/// - a connection is in at most one room;
/// - a connection id is in room R's member set iff its recorded room is R;
/// - rooms with no members have no entry.
///
/// Calls naming an untracked connection, or a room the connection is not in,
/// are silent no-ops that return `false`.
pub struct PresenceTracker<S> {
    connections: HashMap<ConnectionId, Connection>,
    rooms: BTreeMap<RoomId, BTreeSet<ConnectionId>>,
    sink: S,
}

impl<S: EventSink> PresenceTracker<S> {
    pub fn new(sink: S) -> Self {
        Self {
            connections: HashMap::new(),
            rooms: BTreeMap::new(),
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Register a fresh connection with no room and the default name.
    pub fn connect(&mut self, id: ConnectionId) -> bool {
        if self.connections.contains_key(&id) {
            return false;
        }
        debug!(connection_id = %id, "connection registered");
        self.connections.insert(id, Connection::new());
        true
    }

    /// Move a connection into `room`, leaving its previous room first.
    ///
    /// Re-joining the room the connection is already in only refreshes the
    /// display name and repeats the `roomInfo` acknowledgment; the other
    /// members are not told about a join that did not change occupancy.
    pub fn join_room(
        &mut self,
        id: &ConnectionId,
        room: &RoomId,
        display_name: Option<String>,
    ) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        let previous = conn.room.clone();
        let display_name = display_or_default(display_name);

        if previous.as_ref() == Some(room) {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.display_name = display_name;
            }
            let online_count = self.occupancy(room);
            self.sink.send(
                id,
                &ServerEvent::RoomInfo {
                    room_id: room.clone(),
                    online_count,
                },
            );
            debug!(connection_id = %id, room_id = %room, "rejoined current room");
            return true;
        }

        if let Some(previous) = previous {
            self.remove_member(id, &previous);
        }

        let members = self.rooms.entry(room.clone()).or_default();
        members.insert(id.clone());
        let online_count = members.len();
        let others: Vec<ConnectionId> = members.iter().filter(|m| *m != id).cloned().collect();

        if let Some(conn) = self.connections.get_mut(id) {
            conn.room = Some(room.clone());
            conn.display_name = display_name.clone();
        }

        self.deliver_all(
            &others,
            &ServerEvent::UserJoined {
                username: display_name,
                online_count,
            },
        );
        self.sink.send(
            id,
            &ServerEvent::RoomInfo {
                room_id: room.clone(),
                online_count,
            },
        );

        debug!(connection_id = %id, room_id = %room, online_count, "joined room");
        true
    }

    /// Take a connection out of `room` and tell the remaining members.
    ///
    /// Clears the recorded room when it was `room`, so a client-initiated
    /// leave does not leave a dangling reference behind.
    pub fn leave_room(&mut self, id: &ConnectionId, room: &RoomId) -> bool {
        if !self.connections.contains_key(id) {
            return false;
        }
        if !self.remove_member(id, room) {
            return false;
        }
        if let Some(conn) = self.connections.get_mut(id) {
            if conn.room.as_ref() == Some(room) {
                conn.room = None;
            }
        }
        true
    }

    /// Relay a message to every member of its room, sender included.
    ///
    /// Dropped unless the sender is tracked and currently in that room.
    pub fn send_message(&mut self, id: &ConnectionId, message: OutgoingMessage) -> bool {
        let in_room = self
            .connections
            .get(id)
            .is_some_and(|conn| conn.room.as_ref() == Some(&message.room_id));
        if !in_room {
            debug!(connection_id = %id, room_id = %message.room_id, "message dropped, sender not in room");
            return false;
        }

        let recipients: Vec<ConnectionId> = self
            .rooms
            .get(&message.room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();

        let room_id = message.room_id.clone();
        let event = ServerEvent::NewMessage(ChatMessage {
            id: message.id,
            room_id: message.room_id,
            content: message.content,
            sender: message.sender,
            created_at: message.created_at.unwrap_or_else(Utc::now),
        });
        self.deliver_all(&recipients, &event);

        debug!(connection_id = %id, room_id = %room_id, recipients = recipients.len(), "message relayed");
        true
    }

    /// Rename a connection for future notifications. An empty name falls
    /// back to the default, as on join.
    pub fn set_display_name(&mut self, id: &ConnectionId, display_name: String) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        conn.display_name = display_or_default(Some(display_name));
        true
    }

    /// Leave the current room, if any, and forget the connection.
    pub fn disconnect(&mut self, id: &ConnectionId) -> bool {
        let Some(room) = self.connections.get(id).map(|conn| conn.room.clone()) else {
            return false;
        };
        if let Some(room) = room {
            self.remove_member(id, &room);
        }
        self.connections.remove(id);
        debug!(connection_id = %id, "connection removed");
        true
    }

    /// Forget every connection and room without notifying anyone.
    pub fn reset(&mut self) {
        self.connections.clear();
        self.rooms.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn occupancy(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, BTreeSet::len)
    }

    pub fn room_of(&self, id: &ConnectionId) -> Option<&RoomId> {
        self.connections.get(id).and_then(|conn| conn.room.as_ref())
    }

    pub fn display_name_of(&self, id: &ConnectionId) -> Option<&str> {
        self.connections.get(id).map(|conn| conn.display_name.as_str())
    }

    pub fn is_tracked(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Members of `room`, ordered by connection id.
    pub fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Occupied rooms, ordered by room id.
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .map(|(room_id, members)| RoomSummary {
                room_id: room_id.clone(),
                online_count: members.len(),
            })
            .collect()
    }

    /// Remove `id` from `room`'s set and notify who is left. Does not touch
    /// the connection's recorded room.
    fn remove_member(&mut self, id: &ConnectionId, room: &RoomId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        if !members.remove(id) {
            return false;
        }
        let online_count = members.len();
        let remaining: Vec<ConnectionId> = members.iter().cloned().collect();
        if remaining.is_empty() {
            self.rooms.remove(room);
        }

        let username = self
            .connections
            .get(id)
            .map(|conn| conn.display_name.clone())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
        self.deliver_all(
            &remaining,
            &ServerEvent::UserLeft {
                username,
                online_count,
            },
        );

        debug!(connection_id = %id, room_id = %room, online_count, "left room");
        true
    }

    fn deliver_all(&self, recipients: &[ConnectionId], event: &ServerEvent) {
        if recipients.is_empty() {
            return;
        }
        let delivered = self.sink.broadcast(recipients, event);
        if delivered < recipients.len() {
            debug!(
                event = event.event_name(),
                recipients = recipients.len(),
                delivered,
                "some recipients unreachable"
            );
        }
    }
}

fn display_or_default(name: Option<String>) -> String {
    name.filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string())
}
