use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RoomId;

/// Events a client sends over its socket.
///
/// Wire shape: `{"event": "joinRoom", "data": {"roomId": "lobby"}}`.
/// `connect` and `disconnect` are not frames; they are the socket opening and
/// closing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        username: Option<String>,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendMessage {
        room_id: RoomId,
        content: String,
        sender: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        created_at: Option<DateTime<Utc>>,
    },
    SetUsername {
        username: String,
        #[serde(default)]
        room_id: Option<RoomId>,
    },
}

impl ClientEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::SetUsername { .. } => "setUsername",
        }
    }
}

/// A chat message relayed to every member of a room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub room_id: RoomId,
    pub content: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

/// Events the server pushes to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// To the members a user just joined.
    UserJoined { username: String, online_count: usize },
    /// To the joining connection only.
    RoomInfo { room_id: RoomId, online_count: usize },
    /// To the members a user just left.
    UserLeft { username: String, online_count: usize },
    NewMessage(ChatMessage),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "userJoined",
            Self::RoomInfo { .. } => "roomInfo",
            Self::UserLeft { .. } => "userLeft",
            Self::NewMessage(_) => "newMessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_join_room_with_username() {
        let raw = r#"{"event":"joinRoom","data":{"roomId":"lobby","username":"ana"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom {
                room_id: RoomId::from("lobby"),
                username: Some("ana".into()),
            }
        );
        assert_eq!(event.event_name(), "joinRoom");
    }

    #[test]
    fn parse_join_room_without_username() {
        let raw = r#"{"event":"joinRoom","data":{"roomId":"lobby"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, ClientEvent::JoinRoom { username: None, .. }));
    }

    #[test]
    fn parse_send_message_with_optional_fields() {
        let raw = json!({
            "event": "sendMessage",
            "data": {
                "roomId": "lobby",
                "content": "hi",
                "sender": "ana",
                "id": "64f1c0",
                "createdAt": "2026-03-01T10:00:00Z"
            }
        });
        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        let ClientEvent::SendMessage { id, created_at, content, .. } = event else {
            panic!("expected sendMessage");
        };
        assert_eq!(content, "hi");
        assert_eq!(id.as_deref(), Some("64f1c0"));
        assert_eq!(created_at.unwrap().to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn parse_set_username_without_room() {
        let raw = r#"{"event":"setUsername","data":{"username":"bo"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ClientEvent::SetUsername {
                username: "bo".into(),
                room_id: None,
            }
        );
    }

    #[test]
    fn unknown_event_is_rejected() {
        let raw = r#"{"event":"deleteRoom","data":{"roomId":"lobby"}}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let raw = r#"{"event":"sendMessage","data":{"roomId":"lobby","sender":"ana"}}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn server_events_use_camel_case_keys() {
        let event = ServerEvent::RoomInfo {
            room_id: RoomId::from("lobby"),
            online_count: 2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "roomInfo", "data": {"roomId": "lobby", "onlineCount": 2}})
        );

        let left = ServerEvent::UserLeft {
            username: "ana".into(),
            online_count: 0,
        };
        let value = serde_json::to_value(&left).unwrap();
        assert_eq!(value["event"], "userLeft");
        assert_eq!(value["data"]["username"], "ana");
        assert_eq!(value["data"]["onlineCount"], 0);
    }

    #[test]
    fn new_message_omits_missing_id() {
        let event = ServerEvent::NewMessage(ChatMessage {
            id: None,
            room_id: RoomId::from("lobby"),
            content: "hi".into(),
            sender: "ana".into(),
            created_at: "2026-03-01T10:00:00Z".parse().unwrap(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "newMessage");
        assert!(value["data"].get("id").is_none());
        assert_eq!(value["data"]["roomId"], "lobby");
        assert_eq!(value["data"]["createdAt"], "2026-03-01T10:00:00Z");
    }

    #[test]
    fn event_names_match_wire_tags() {
        let event = ServerEvent::UserJoined {
            username: "ana".into(),
            online_count: 1,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.event_name());
    }
}
