#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures_util::{SinkExt, StreamExt};
use larder_agents::{register_builtins, AgentRegistry};
use larder_core::SessionBus;
use larder_gateway::{AppState, GatewayServer, MetricsConfig};
use larder_orchestrator::{Orchestrator, OrchestratorConfig};
use larder_pool::{ConnectionPool, PoolConfig};
use larder_queue::{AdapterConfig, InProcessConfig, InProcessQueue, TaskQueueAdapter};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Helper: full stack on a random port, returning the address and state.
async fn start_test_server() -> (String, Arc<AppState>) {
    start_with_default("echo").await
}

async fn start_with_default(agent: &str) -> (String, Arc<AppState>) {
    let registry = Arc::new(
        register_builtins(AgentRegistry::builder())
            .default_agent(agent)
            .build()
            .unwrap(),
    );
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let workers = registry.clone();
    let adapter = TaskQueueAdapter::start(AdapterConfig::default(), move |reports| {
        InProcessQueue::new(workers, InProcessConfig::default(), reports)
    });
    let bus: Arc<dyn SessionBus> = pool.clone();
    let orchestrator = Arc::new(
        Orchestrator::new(registry, bus, OrchestratorConfig::default())
            .unwrap()
            .with_queue(Arc::new(adapter)),
    );
    let state = AppState::new(pool, orchestrator, MetricsConfig::default());
    let app = GatewayServer::build(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

async fn connect(addr: &str, session: Option<&str>) -> WsStream {
    let url = match session {
        Some(s) => format!("ws://{addr}/ws?session_id={s}"),
        None => format!("ws://{addr}/ws"),
    };
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn next_event(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn wait_for_connections(state: &AppState, n: usize) {
    while state.pool.connection_count() < n {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// 1. Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _state) = start_test_server().await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "larder");
}

// ---------------------------------------------------------------------------
// 2. Session S1: query from one client, events on every client
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_query_reaches_all_clients() {
    let (addr, state) = start_test_server().await;
    let mut asker = connect(&addr, Some("S1")).await;
    let mut watcher = connect(&addr, Some("S1")).await;
    wait_for_connections(&state, 2).await;

    send(
        &mut asker,
        json!({"type": "query", "session_id": "S1", "payload": {"text": "what is in the pantry"}}),
    )
    .await;

    for ws in [&mut asker, &mut watcher] {
        let queued = next_event(ws).await;
        let running = next_event(ws).await;
        let result = next_event(ws).await;

        assert_eq!(queued["type"], "status");
        assert_eq!(queued["session_id"], "S1");
        assert_eq!(queued["payload"]["state"], "queued");
        assert_eq!(running["payload"]["state"], "running");
        assert_eq!(result["type"], "result");
        assert_eq!(result["payload"]["output"]["text"], "what is in the pantry");
        assert_eq!(queued["payload"]["invocation_id"], result["payload"]["invocation_id"]);
        assert!(result["ts"].is_string());
    }
}

// ---------------------------------------------------------------------------
// 3. A query binds an unbound connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_query_binds_connection() {
    let (addr, state) = start_test_server().await;
    let mut ws = connect(&addr, None).await;
    wait_for_connections(&state, 1).await;

    send(&mut ws, json!({"type": "query", "session_id": "S2", "payload": {"text": "hi"}})).await;
    let first = next_event(&mut ws).await;
    assert_eq!(first["payload"]["state"], "queued");
    assert_eq!(state.pool.connections_for("S2").len(), 1);
}

// ---------------------------------------------------------------------------
// 4. Malformed frames get an invalid_message error, the socket stays up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_malformed_frame_keeps_socket() {
    let (addr, state) = start_test_server().await;
    let mut ws = connect(&addr, Some("S1")).await;
    wait_for_connections(&state, 1).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["kind"], "invalid_message");

    send(&mut ws, json!({"type": "heartbeat", "session_id": "S1"})).await;
    send(&mut ws, json!({"type": "query", "session_id": "S1", "payload": {"text": "still here"}})).await;
    let queued = next_event(&mut ws).await;
    assert_eq!(queued["payload"]["state"], "queued");
}

// ---------------------------------------------------------------------------
// 5. Long-running agents go through the queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_long_running_query_via_queue() {
    let (addr, state) = start_with_default("sleep").await;
    let mut ws = connect(&addr, Some("S3")).await;
    wait_for_connections(&state, 1).await;

    send(
        &mut ws,
        json!({"type": "query", "session_id": "S3", "payload": {"text": "slow roast"}}),
    )
    .await;
    let states: Vec<Value> = vec![
        next_event(&mut ws).await["payload"]["state"].clone(),
        next_event(&mut ws).await["payload"]["state"].clone(),
    ];
    assert_eq!(states, vec![json!("queued"), json!("running")]);
    let result = next_event(&mut ws).await;
    assert_eq!(result["type"], "result");
    assert_eq!(result["payload"]["output"]["text"], "slow roast");
    assert_eq!(result["payload"]["output"]["delayed_ms"], 0);

    let queue = state.orchestrator.queue().unwrap();
    assert_eq!(queue.stats().submitted, 1);
    assert_eq!(queue.stats().succeeded, 1);
}

// ---------------------------------------------------------------------------
// 6. DELETE /sessions/{id} closes the session's sockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_session_closes_socket() {
    let (addr, state) = start_test_server().await;
    let mut ws = connect(&addr, Some("S4")).await;
    wait_for_connections(&state, 1).await;

    let resp = reqwest::Client::new()
        .delete(format!("http://{addr}/sessions/S4"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["closed_connections"], 1);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let metrics: Value = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["active_sessions"], 0);
}
