//! # Gateway Write Replay
//!
//! Delivers queued writes to whichever endpoint is active when the queue
//! drains.
//!
//! ```text
//! QueuedWrite { key: "sessions/s1/messages", payload }
//!        │
//!        ▼
//! POST <active.url>/api/sessions/s1/messages
//!      Authorization: Bearer <credential>
//!      X-Gatewatch-Write-Id: <write id>
//!      body = payload
//!
//!   2xx            → delivered, removed from the queue
//!   anything else  → ReplayFailed, moved to the queue tail
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use gatewatch_core::cache::QueuedWrite;
use gatewatch_store::{StoreError, StoreResult, WriteReplayer};

use crate::error::{SyncError, SyncResult};
use crate::protocol::write_url;
use crate::registry::EndpointRegistry;

/// Header carrying the queued write id so the gateway can drop duplicates.
pub const WRITE_ID_HEADER: &str = "x-gatewatch-write-id";

/// [`WriteReplayer`] that POSTs to the active endpoint.
#[derive(Clone)]
pub struct GatewayReplayer {
    client: reqwest::Client,
    registry: EndpointRegistry,
}

impl GatewayReplayer {
    /// Creates a replayer with a per-write timeout.
    pub fn new(registry: EndpointRegistry, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(GatewayReplayer { client, registry })
    }

    /// Sends `write` now. Used for the direct path while online as well as
    /// for queue drains.
    pub async fn deliver(&self, write: &QueuedWrite) -> SyncResult<()> {
        let active = self
            .registry
            .active()
            .await
            .ok_or(SyncError::NoActiveEndpoint)?;
        let url = write_url(&active.config.url, &write.key)?;

        let mut request = self
            .client
            .post(url.clone())
            .header(WRITE_ID_HEADER, &write.id)
            .json(&write.payload);
        if let Some(token) = &active.config.credential {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        debug!(write_id = %write.id, endpoint_id = %active.config.id, "Write delivered");
        Ok(())
    }
}

#[async_trait]
impl WriteReplayer for GatewayReplayer {
    async fn replay(&self, write: &QueuedWrite) -> StoreResult<()> {
        self.deliver(write)
            .await
            .map_err(|e| StoreError::replay(&write.key, e))
    }
}
