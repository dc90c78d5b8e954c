use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
    ($name:ident, $prefix:expr) => {
        branded_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

// Assigned by the server when a socket is accepted.
branded_id!(ConnectionId, "conn");
// Chosen by clients; any string names a room.
branded_id!(RoomId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn room_id_keeps_client_value() {
        let room = RoomId::from_raw("lobby");
        assert_eq!(room.as_str(), "lobby");
        assert_eq!(room, RoomId::from("lobby"));
    }

    #[test]
    fn room_id_serializes_as_plain_string() {
        let room = RoomId::from("general");
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"general\"");
        let back: RoomId = serde_json::from_str("\"general\"").unwrap();
        assert_eq!(back, room);
    }

    #[test]
    fn display_and_from_str_agree() {
        let id = ConnectionId::new();
        let parsed: ConnectionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn room_ids_order_lexically() {
        let mut rooms = vec![RoomId::from("b"), RoomId::from("a"), RoomId::from("c")];
        rooms.sort();
        let names: Vec<&str> = rooms.iter().map(RoomId::as_str).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
