//! In-process doubles for tests: a scripted health probe and an axum mock
//! gateway serving `/health`, `/ws` and `/api/{*path}`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use gatewatch_core::endpoint::EndpointConfig;

use crate::error::{SyncError, SyncResult};
use crate::health::{HealthProbe, ProbeReport};

// =============================================================================
// Scripted Probe
// =============================================================================

/// Probe whose outcome per endpoint id is set by the test.
#[derive(Default)]
pub struct ScriptedProbe {
    outcomes: StdMutex<HashMap<String, Option<u64>>>,
}

impl ScriptedProbe {
    /// `Some(ms)` answers online with that latency; `None` fails.
    /// Unscripted endpoints fail.
    pub fn set(&self, id: &str, outcome: Option<u64>) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(id.to_string(), outcome);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, endpoint: &EndpointConfig) -> SyncResult<ProbeReport> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&endpoint.id)
            .cloned()
            .flatten();
        match outcome {
            Some(ms) => Ok(ProbeReport {
                response_time_ms: ms,
                ..Default::default()
            }),
            None => Err(SyncError::HealthCheckFailed("scripted failure".into())),
        }
    }
}

// =============================================================================
// Mock Gateway
// =============================================================================

/// How the mock answers an `auth` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Reply `auth_ok`.
    Ack,
    /// Say nothing.
    Silent,
    /// Reply `auth_error`.
    Reject,
}

struct MockState {
    healthy: AtomicBool,
    auth: StdMutex<AuthMode>,
    write_status: AtomicU16,
    sessions: AtomicUsize,
    received: Mutex<Vec<Value>>,
    writes: Mutex<Vec<(String, Value, Option<String>)>>,
    push_tx: broadcast::Sender<String>,
    kick_tx: broadcast::Sender<u16>,
}

/// Axum gateway on an ephemeral local port.
pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockGateway {
    /// Starts a healthy gateway that acknowledges auth.
    pub async fn start() -> Self {
        let (push_tx, _) = broadcast::channel(64);
        let (kick_tx, _) = broadcast::channel(8);
        let state = Arc::new(MockState {
            healthy: AtomicBool::new(true),
            auth: StdMutex::new(AuthMode::Ack),
            write_status: AtomicU16::new(200),
            sessions: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            push_tx,
            kick_tx,
        });

        let app = Router::new()
            .route("/health", get(health))
            .route("/ws", get(stream))
            .route("/api/{*path}", post(write))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        MockGateway { addr, state, task }
    }

    /// Base URL (`http://127.0.0.1:<port>`).
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_auth_mode(&self, mode: AuthMode) {
        *self.state.auth.lock().unwrap() = mode;
    }

    pub fn set_write_status(&self, status: u16) {
        self.state.write_status.store(status, Ordering::SeqCst);
    }

    /// Stream sessions accepted so far.
    pub fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// Sends a text frame to every connected client.
    pub fn push(&self, frame: Value) {
        let _ = self.state.push_tx.send(frame.to_string());
    }

    /// Closes every connected client with `code`.
    pub fn kick(&self, code: u16) {
        let _ = self.state.kick_tx.send(code);
    }

    /// Frames received from clients, in order.
    pub async fn received(&self) -> Vec<Value> {
        self.state.received.lock().await.clone()
    }

    /// Received frames of one type.
    pub async fn received_of(&self, kind: &str) -> Vec<Value> {
        self.received()
            .await
            .into_iter()
            .filter(|f| f["type"] == kind)
            .collect()
    }

    /// Waits until at least `count` frames of `kind` arrived.
    pub async fn wait_for_frames(&self, kind: &str, count: usize) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frames = self.received_of(kind).await;
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} '{}' frames", count, kind))
    }

    /// Writes received on `/api/...`: (key, body, authorization header).
    pub async fn writes(&self) -> Vec<(String, Value, Option<String>)> {
        self.state.writes.lock().await.clone()
    }
}

async fn health(State(state): State<Arc<MockState>>) -> Response {
    if state.healthy.load(Ordering::SeqCst) {
        Json(json!({
            "uptime": 42.0,
            "connectedClients": state.sessions.load(Ordering::SeqCst),
            "activeAgents": 2,
            "activeSessions": 3,
            "cronJobs": 1,
            "version": "test"
        }))
        .into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn write(
    State(state): State<Arc<MockState>>,
    Path(path): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.writes.lock().await.push((path, body, auth));
    StatusCode::from_u16(state.write_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn stream(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn reply(socket: &mut WebSocket, frame: Value) -> bool {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .is_ok()
}

async fn client_session(mut socket: WebSocket, state: Arc<MockState>) {
    let mut pushes = state.push_tx.subscribe();
    let mut kicks = state.kick_tx.subscribe();
    state.sessions.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    let kind = frame["type"].as_str().unwrap_or_default().to_string();
                    state.received.lock().await.push(frame);

                    let mode = *state.auth.lock().unwrap();
                    let ok = match (kind.as_str(), mode) {
                        ("auth", AuthMode::Ack) => reply(&mut socket, json!({"type": "auth_ok"})).await,
                        ("auth", AuthMode::Reject) => {
                            reply(&mut socket, json!({"type": "auth_error", "message": "bad token"})).await
                        }
                        ("ping", _) => reply(&mut socket, json!({"type": "pong"})).await,
                        _ => true,
                    };
                    if !ok {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Ok(frame) = pushes.recv() => {
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            Ok(code) = kicks.recv() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: String::from("kicked").into(),
                    })))
                    .await;
                break;
            }
        }
    }
}
