use crate::metrics::{MetricsAggregator, MetricsConfig};
use crate::router::MessageRouter;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use larder_core::{Envelope, LarderError};
use larder_orchestrator::Orchestrator;
use larder_pool::{Connection, ConnectionPool, HeartbeatMonitor};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    /// Connection pool.
    pub pool: Arc<ConnectionPool>,
    /// Query dispatch.
    pub orchestrator: Arc<Orchestrator>,
    /// Inbound frame routing.
    pub router: Arc<MessageRouter>,
    /// Metrics snapshots.
    pub metrics: Arc<MetricsAggregator>,
}

impl AppState {
    /// Wire the router and metrics around `pool` and `orchestrator`.
    pub fn new(pool: Arc<ConnectionPool>, orchestrator: Arc<Orchestrator>, metrics: MetricsConfig) -> Arc<Self> {
        let router = Arc::new(MessageRouter::new(orchestrator.clone(), pool.clone()));
        let metrics = Arc::new(MetricsAggregator::new(pool.clone(), orchestrator.clone(), metrics));
        Arc::new(Self {
            pool,
            orchestrator,
            router,
            metrics,
        })
    }

    /// Cancel the session's invocations and drop the session with its
    /// connections. Returns `None` if there was nothing to tear down.
    pub async fn teardown_session(&self, session_id: &str) -> Option<(usize, usize)> {
        let cancelled = self.orchestrator.cancel_session(session_id).await;
        let closed = self
            .pool
            .remove_session(session_id)
            .map(|s| s.connections.len());
        if closed.is_none() && cancelled == 0 {
            return None;
        }
        info!(session_id = %session_id, cancelled, "Session torn down");
        Some((cancelled, closed.unwrap_or(0)))
    }
}

/// Background tasks started next to the HTTP server.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Tasks held.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// No tasks held.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// The realtime gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// The axum router for every endpoint.
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/metrics/history", get(history_handler))
            .route("/sessions/{id}", delete(delete_session_handler))
            .with_state(state)
    }

    /// Start the heartbeat monitor and the metrics sampler. Sessions the
    /// monitor expires are torn down like a `DELETE`.
    pub fn spawn_background(state: &Arc<AppState>, sample_interval: Duration) -> BackgroundTasks {
        let teardown = state.clone();
        let monitor = HeartbeatMonitor::new(state.pool.clone()).spawn(move |expired| {
            for session_id in expired {
                let state = teardown.clone();
                tokio::spawn(async move {
                    state.teardown_session(&session_id).await;
                });
            }
        });
        let sampler = state.metrics.clone().spawn_sampler(sample_interval);
        BackgroundTasks {
            handles: vec![monitor, sampler],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    session_id: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "larder",
        "connections": state.pool.connection_count(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn history_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.history())
}

async fn delete_session_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    match state.teardown_session(&id).await {
        Some((cancelled, closed)) => Json(json!({
            "session_id": id,
            "cancelled": cancelled,
            "closed_connections": closed,
        }))
        .into_response(),
        None => {
            let error = LarderError::NotFound(format!("session {id}")).to_descriptor();
            (StatusCode::NOT_FOUND, Json(error)).into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: Option<String>) {
    let (conn, mut rx) = Connection::open(state.pool.config().buffer);
    let conn = match session_id.filter(|s| !s.trim().is_empty()) {
        Some(session_id) => conn.with_session(session_id),
        None => conn,
    };
    let connection_id = conn.id;
    let bound = conn.session_id.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if let Err(e) = state.pool.register(conn) {
        warn!(error = %e, "Refusing WebSocket connection");
        if let Ok(frame) = Envelope::error("", None, &e.to_descriptor()).to_json() {
            let _ = ws_sender.send(Message::Text(frame.into())).await;
        }
        return;
    }
    info!(connection_id = %connection_id, session_id = ?bound, "WebSocket connected");

    // Pool channel -> socket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Dropping unencodable event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Socket -> router
    let router = state.router.clone();
    let pool = state.pool.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    router.handle_frame(text.as_str(), connection_id);
                }
                Message::Binary(_) => {
                    router.reject(
                        connection_id,
                        &LarderError::InvalidMessage("binary frames are not supported".into()),
                    );
                }
                Message::Ping(_) | Message::Pong(_) => {
                    let _ = pool.heartbeat(connection_id);
                }
                Message::Close(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.pool.deregister(connection_id);
    info!(connection_id = %connection_id, "WebSocket disconnected");
}
