//! Text-frame codec between sockets and [`ClientEvent`] / [`ServerEvent`].

use std::sync::Arc;

use huddle_core::{ClientEvent, ServerEvent};

/// Parse one inbound text frame.
pub fn decode(text: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Serialize an outbound event once so it can be shared across recipients.
pub fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            tracing::error!(event = event.event_name(), error = %e, "failed to encode event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::RoomId;
    use serde_json::Value;

    #[test]
    fn decode_join() {
        let event = decode(r#"{"event":"joinRoom","data":{"roomId":"lobby","username":"alice"}}"#)
            .unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom {
                room_id: RoomId::from("lobby"),
                username: Some("alice".into()),
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_event() {
        assert!(decode(r#"{"event":"shout","data":{}}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encode_room_info() {
        let text = encode(&ServerEvent::RoomInfo {
            room_id: RoomId::from("lobby"),
            online_count: 2,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "roomInfo");
        assert_eq!(value["data"]["roomId"], "lobby");
        assert_eq!(value["data"]["onlineCount"], 2);
    }
}
