//! # Health Probing
//!
//! One bounded-timeout health request per endpoint.
//!
//! ```text
//! GET <url>/health        Authorization: Bearer <credential>
//!
//!   200 { "uptime": 12.5, "connectedClients": 3, "activeAgents": 2,
//!         "activeSessions": 7, "cronJobs": 4, "version": "1.4.0" }
//!        → ProbeReport { response_time_ms, stats }
//!
//!   non-2xx, timeout, network error → Err(SyncError)
//! ```
//!
//! The body is optional: an empty or unparsable 200 still counts as online,
//! with empty counters.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use gatewatch_core::endpoint::{BackendStats, EndpointConfig};

use crate::error::{SyncError, SyncResult};
use crate::protocol::health_url;

/// Outcome of a successful probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    /// Round-trip time of the probe.
    pub response_time_ms: u64,
    /// Counters reported by the gateway.
    pub stats: BackendStats,
}

/// Checks one endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes `endpoint`. Any error counts as a probe failure.
    async fn probe(&self, endpoint: &EndpointConfig) -> SyncResult<ProbeReport>;
}

/// [`HealthProbe`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    /// Shared HTTP client (connection pool).
    client: reqwest::Client,
    /// Path appended to the endpoint URL.
    path: String,
    /// Per-request timeout.
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Creates a probe hitting `<url><path>` with the given timeout.
    pub fn new(timeout: Duration, path: impl Into<String>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpHealthProbe {
            client,
            path: path.into(),
            timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &EndpointConfig) -> SyncResult<ProbeReport> {
        let url = health_url(&endpoint.url, &self.path)?;
        let started = Instant::now();

        let mut request = self.client.get(url.clone());
        if let Some(token) = &endpoint.credential {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(self.timeout.as_millis() as u64)
            } else {
                SyncError::HealthCheckFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(self.timeout.as_millis() as u64)
            } else {
                SyncError::HealthCheckFailed(e.to_string())
            }
        })?;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let stats = serde_json::from_slice::<BackendStats>(&body).unwrap_or_else(|e| {
            debug!(endpoint_id = %endpoint.id, error = %e, "Health body not parsed");
            BackendStats::default()
        });

        Ok(ProbeReport {
            response_time_ms,
            stats,
        })
    }
}
