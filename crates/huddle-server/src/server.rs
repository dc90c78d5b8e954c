use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use huddle_presence::RoomSummary;
use huddle_telemetry::MetricsRecorder;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::actor::{spawn_presence_actor, PresenceHandle};
use crate::client::ClientRegistry;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{self, SocketTimings};

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ClientRegistry>,
    /// One permit per allowed socket, taken before the upgrade completes.
    pub connection_slots: Arc<Semaphore>,
    pub presence: PresenceHandle,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the registry and spawn the presence actor that delivers through
    /// it. The actor stops with `shutdown`.
    pub fn new(
        config: ServerConfig,
        metrics: Option<Arc<MetricsRecorder>>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> (Self, JoinHandle<()>) {
        let registry = Arc::new(ClientRegistry::new(config.max_send_queue, metrics.clone()));
        let (presence, actor) = spawn_presence_actor(
            Arc::clone(&registry),
            metrics.clone(),
            config.command_queue,
            shutdown.token(),
        );
        let state = Self {
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            registry,
            presence,
            metrics,
            shutdown,
            start_time: Instant::now(),
        };
        (state, actor)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the presence actor and start serving. Returns a handle to shut
/// it down.
pub async fn start(
    config: ServerConfig,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, ServerError> {
    let addr = config.bind_addr();
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let (state, actor) = AppState::new(config, metrics, Arc::clone(&shutdown));
    let presence = state.presence.clone();

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(source) => {
            shutdown.shutdown();
            return Err(ServerError::Bind { addr, source });
        }
    };
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "huddle server started");

    let router = build_router(state);
    let token = shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        presence,
        shutdown,
        shutdown_timeout,
        tasks: vec![server, actor],
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    local_addr: SocketAddr,
    presence: PresenceHandle,
    shutdown: Arc<ShutdownCoordinator>,
    shutdown_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    /// Cancelled when the server starts shutting down. Background tasks owned
    /// by the caller (metrics snapshots) should stop on it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Stop accepting, close every socket and wait (bounded) for the listener
    /// and presence actor to finish.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.shutdown
            .graceful_shutdown(self.tasks, self.shutdown_timeout)
            .await;
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Ok(slot) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        tracing::warn!(
            connections = state.registry.count(),
            max = state.config.max_connections,
            "connection limit reached, rejecting upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let timings = SocketTimings {
        heartbeat_interval: Duration::from_secs(state.config.heartbeat_interval_secs),
        heartbeat_timeout: Duration::from_secs(state.config.heartbeat_timeout_secs),
    };
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            websocket::serve_socket(
                socket,
                state.registry,
                state.presence,
                timings,
                state.shutdown.token(),
                slot,
            )
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.presence.stats().await;
    Json(health::health_check(state.start_time, stats))
}

/// GET /rooms
async fn rooms_handler(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.presence.rooms().await)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => Json(metrics.view()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use huddle_core::{ClientEvent, ConnectionId, RoomId};
    use tower::ServiceExt;

    fn make_state(config: ServerConfig, metrics: Option<Arc<MetricsRecorder>>) -> AppState {
        let (state, _actor) = AppState::new(config, metrics, Arc::new(ShutdownCoordinator::new()));
        state
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_presence_counts() {
        let state = make_state(ServerConfig::default(), None);
        let a = ConnectionId::new();
        state.presence.connect(a.clone()).await;
        state
            .presence
            .event(
                a,
                ClientEvent::JoinRoom {
                    room_id: RoomId::from("lobby"),
                    username: None,
                },
            )
            .await;

        let (status, body) = get_json(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["rooms"], 1);
    }

    #[tokio::test]
    async fn rooms_lists_occupancy_sorted() {
        let state = make_state(ServerConfig::default(), None);
        for (room, n) in [("zeta", 1), ("alpha", 2)] {
            for _ in 0..n {
                let id = ConnectionId::new();
                state.presence.connect(id.clone()).await;
                state
                    .presence
                    .event(
                        id,
                        ClientEvent::JoinRoom {
                            room_id: RoomId::from(room),
                            username: Some("x".into()),
                        },
                    )
                    .await;
            }
        }

        let (status, body) = get_json(build_router(state), "/rooms").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([
                {"roomId": "alpha", "onlineCount": 2},
                {"roomId": "zeta", "onlineCount": 1}
            ])
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_requires_recorder() {
        let state = make_state(ServerConfig::default(), None);
        let (status, _) = get_json(build_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        let state = make_state(ServerConfig::default(), Some(Arc::clone(&recorder)));
        state.presence.connect(ConnectionId::new()).await;
        let _ = state.presence.stats().await;

        let (status, body) = get_json(build_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counters"]["presence_connects_total"], 1);
        assert_eq!(body["gauges"]["presence_connections"], 1.0);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let state = make_state(ServerConfig::default(), None);
        let (status, _) = get_json(build_router(state), "/ws").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let state = make_state(ServerConfig::default(), None);
        let (status, _) = get_json(build_router(state), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let handle = start(config, None).await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);

        let url = format!("http://{}/health", handle.local_addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let token = handle.shutdown_token();
        handle.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn start_reports_bind_failure() {
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();
        let config = ServerConfig {
            port,
            ..ServerConfig::default()
        };
        let err = match start(config, None).await {
            Ok(_) => panic!("bind should fail on a taken port"),
            Err(e) => e,
        };
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
