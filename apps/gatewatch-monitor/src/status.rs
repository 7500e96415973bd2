//! # Status Server
//!
//! ```text
//! GET /health   → 200 "OK"
//! GET /status   → 200 GatewatchStatus (JSON)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use gatewatch_sync::{Gatewatch, SyncError, SyncResult};

/// Serves the orchestrator's status over HTTP.
pub struct StatusServer {
    gatewatch: Arc<Gatewatch>,
    bind_addr: String,
}

/// Handle for stopping the status server.
pub struct StatusHandle {
    /// Bound address (useful with port 0).
    pub local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl StatusHandle {
    /// Stops accepting requests and waits for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

impl StatusServer {
    pub fn new(gatewatch: Arc<Gatewatch>, bind_addr: impl Into<String>) -> Self {
        StatusServer {
            gatewatch,
            bind_addr: bind_addr.into(),
        }
    }

    /// Binds and serves in the background.
    pub async fn start(self) -> SyncResult<StatusHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = router(self.gatewatch);

        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            SyncError::Internal(format!("Failed to bind to {}: {}", self.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Status server started");

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Status server shutting down");
                })
                .await
                .ok();
        });

        Ok(StatusHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

fn router(gatewatch: Arc<Gatewatch>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(gatewatch)
}

/// Liveness of the monitor itself.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn status_handler(State(gatewatch): State<Arc<Gatewatch>>) -> impl IntoResponse {
    Json(gatewatch.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewatch_sync::{GatewatchBuilder, GatewatchConfig};

    #[tokio::test]
    async fn test_health_and_status_endpoints() {
        let gatewatch = Arc::new(GatewatchBuilder::new(GatewatchConfig::default()).build().unwrap());
        let handle = StatusServer::new(gatewatch, "127.0.0.1:0")
            .start()
            .await
            .unwrap();
        let base = format!("http://{}", handle.local_addr);

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert!(health.status().is_success());
        assert_eq!(health.text().await.unwrap(), "OK");

        let status: serde_json::Value = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["running"], false);
        assert_eq!(status["connection"]["phase"], "disconnected");
        assert_eq!(status["pendingWrites"], 0);
        assert!(status["cache"].is_object());

        handle.shutdown().await;
    }
}
