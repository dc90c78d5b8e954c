//! Room membership and presence tracking.
//!
//! [`PresenceTracker`] owns the connection table and the room membership
//! map. It never touches sockets: every notification goes out through an
//! [`EventSink`] addressed by [`ConnectionId`](huddle_core::ConnectionId).

pub mod sink;
pub mod tracker;

pub use sink::{EventSink, RecordingSink};
pub use tracker::{OutgoingMessage, PresenceTracker, RoomSummary, DEFAULT_DISPLAY_NAME};
