//! # huddle-server
//!
//! Axum HTTP + WebSocket host for the presence tracker.
//!
//! - `/ws`: one socket per client; frames are decoded and forwarded to the
//!   presence actor, which owns the tracker and delivers events back through
//!   the client registry
//! - `/health`, `/rooms`, `/metrics`: read-only views
//! - heartbeat ping/pong liveness and graceful shutdown via `CancellationToken`

pub mod actor;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use actor::{spawn_presence_actor, PresenceHandle, PresenceStats};
pub use client::{ClientConnection, ClientRegistry};
pub use config::{load_settings, load_settings_from_file, HuddleSettings, ServerConfig, TelemetrySettings};
pub use error::{ConfigError, ServerError};
pub use server::{build_router, start, AppState, ServerHandle};
