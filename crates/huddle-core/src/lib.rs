//! Shared identifiers and wire types for the huddle presence server.

pub mod events;
pub mod ids;

pub use events::{ChatMessage, ClientEvent, ServerEvent};
pub use ids::{ConnectionId, RoomId};
