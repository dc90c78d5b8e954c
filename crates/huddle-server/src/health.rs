//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

use crate::actor::PresenceStats;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server answers.
    pub status: String,
    pub uptime_secs: u64,
    /// Tracked connections.
    pub connections: usize,
    /// Occupied rooms.
    pub rooms: usize,
}

pub fn health_check(start_time: Instant, stats: PresenceStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        rooms: stats.rooms,
    }
}
