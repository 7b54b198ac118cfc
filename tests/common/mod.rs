#![allow(dead_code)]

//! In-process mock of the streaming backend: the HTTP command API plus the
//! per-session telemetry WebSocket (echoes pings as pongs, pushes stats
//! snapshots on demand). Tests drive failure modes through the knobs on
//! [`MockBackend`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
}

struct BackendState {
    next_id: AtomicU64,
    /// When set, POST /api/streams/stop/{id} returns 500.
    fail_stop: AtomicBool,
    /// When set, every pong carries nonce 0 instead of echoing the ping's.
    stale_pongs: AtomicBool,
    active: Mutex<Vec<u64>>,
    /// Total websocket connections ever accepted, per session id.
    connections: Mutex<HashMap<u64, usize>>,
    /// Every ping frame received, per session id.
    pings: Mutex<Vec<(u64, serde_json::Value)>>,
    last_http_authorization: Mutex<Option<String>>,
    last_ws_authorization: Mutex<Option<String>>,
    stats_tx: broadcast::Sender<(u64, String)>,
}

impl MockBackend {
    pub async fn spawn() -> Self {
        let state = Arc::new(BackendState {
            next_id: AtomicU64::new(1),
            fail_stop: AtomicBool::new(false),
            stale_pongs: AtomicBool::new(false),
            active: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            pings: Mutex::new(Vec::new()),
            last_http_authorization: Mutex::new(None),
            last_ws_authorization: Mutex::new(None),
            stats_tx: broadcast::channel(64).0,
        });

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/videos/", get(list_videos))
            .route("/api/playlists/", get(list_playlists))
            .route("/api/streams/start", post(start_stream))
            .route("/api/streams/stop/{id}", post(stop_stream))
            .route("/api/streams/active", get(active_streams))
            .route("/api/streams/status/{id}", get(stream_status))
            .route("/ws/streams/{id}", get(ws_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Push a stats snapshot to every telemetry channel open for `id`.
    pub fn push_stats(&self, id: u64, stats: serde_json::Value) {
        let _ = self.state.stats_tx.send((id, stats.to_string()));
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.fail_stop.store(fail, Ordering::Relaxed);
    }

    pub fn set_stale_pongs(&self, stale: bool) {
        self.state.stale_pongs.store(stale, Ordering::Relaxed);
    }

    pub fn connection_count(&self, id: u64) -> usize {
        self.state.connections.lock().get(&id).copied().unwrap_or(0)
    }

    pub fn ping_count(&self, id: u64) -> usize {
        self.state.pings.lock().iter().filter(|(s, _)| *s == id).count()
    }

    pub fn active_ids(&self) -> Vec<u64> {
        self.state.active.lock().clone()
    }

    pub fn last_http_authorization(&self) -> Option<String> {
        self.state.last_http_authorization.lock().clone()
    }

    pub fn last_ws_authorization(&self) -> Option<String> {
        self.state.last_ws_authorization.lock().clone()
    }
}

async fn login(State(_state): State<Arc<BackendState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "access_token": "test-token", "token_type": "bearer" }))
}

async fn list_videos(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    *state.last_http_authorization.lock() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    Json(serde_json::json!([
        { "id": 1, "filename": "demo.mp4", "filepath": "/videos/demo.mp4" }
    ]))
}

async fn list_playlists(State(_state): State<Arc<BackendState>>) -> impl IntoResponse {
    Json(serde_json::json!([
        { "id": 1, "name": "loop", "items": [ { "id": 1, "video_id": 1, "order_index": 0 } ] }
    ]))
}

async fn start_stream(State(state): State<Arc<BackendState>>) -> impl IntoResponse {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    state.active.lock().push(id);
    Json(serde_json::json!({ "id": id, "status": "running", "pid": 4242 }))
}

async fn stop_stream(
    Path(id): Path<u64>,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    if state.fail_stop.load(Ordering::Relaxed) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "detail": "stop failed" })),
        )
            .into_response();
    }
    state.active.lock().retain(|&s| s != id);
    Json(serde_json::json!({ "status": "stopped" })).into_response()
}

async fn active_streams(State(state): State<Arc<BackendState>>) -> impl IntoResponse {
    let sessions: Vec<serde_json::Value> = state
        .active
        .lock()
        .iter()
        .map(|id| serde_json::json!({ "id": id, "status": "running" }))
        .collect();
    Json(sessions)
}

async fn stream_status(
    Path(id): Path<u64>,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    let running = state.active.lock().contains(&id);
    let status = if running { "running" } else { "stopped" };
    Json(serde_json::json!({ "id": id, "status": status }))
}

async fn ws_handler(
    Path(id): Path<u64>,
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    *state.last_ws_authorization.lock() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    ws.on_upgrade(move |socket| handle_telemetry(socket, id, state))
}

async fn handle_telemetry(mut socket: WebSocket, id: u64, state: Arc<BackendState>) {
    // Subscribe before bumping the counter: once a test observes the
    // counter, pushed stats are guaranteed to reach this connection.
    let mut stats_rx = state.stats_tx.subscribe();
    *state.connections.lock().entry(id).or_insert(0) += 1;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let v: serde_json::Value = match serde_json::from_str(text.as_str()) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if v["type"] == "ping" {
                            state.pings.lock().push((id, v.clone()));
                            let nonce = if state.stale_pongs.load(Ordering::Relaxed) {
                                serde_json::json!(0)
                            } else {
                                v["nonce"].clone()
                            };
                            let reply = serde_json::json!({
                                "type": "pong",
                                "nonce": nonce,
                                "server_time": 0,
                            });
                            if socket
                                .send(Message::Text(reply.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            result = stats_rx.recv() => {
                if let Ok((target, payload)) = result {
                    if target == id
                        && socket.send(Message::Text(payload.into())).await.is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}
