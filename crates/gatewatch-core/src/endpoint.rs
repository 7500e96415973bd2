//! # Endpoint Types
//!
//! Gateway endpoint identity, health measurement and the pure selection rules
//! the registry applies on top of them.
//!
//! ## Health State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Per-Endpoint Health Transitions                      │
//! │                                                                         │
//! │                    ┌─────────┐                                          │
//! │                    │ Unknown │  (registered, never probed)              │
//! │                    └────┬────┘                                          │
//! │          probe ok       │       probe failed                            │
//! │        ┌────────────────┼──────────────────┐                            │
//! │        ▼                                   ▼                            │
//! │   ┌─────────┐   probe failed         ┌─────────┐                        │
//! │   │ Online  │ ─────────────────────► │ Offline │ errors < max           │
//! │   └─────────┘ ◄───────────────────── └────┬────┘                        │
//! │        ▲          probe ok                │ errors reach max            │
//! │        │                                  ▼                             │
//! │        │          probe ok           ┌─────────┐                        │
//! │        └──────────────────────────── │  Error  │ sticky until success   │
//! │                                      └─────────┘                        │
//! │                                                                         │
//! │  Only probe outcomes move this machine. Stream failures never do.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Best Endpoint Rule
//! Among `enabled && online` endpoints: highest `priority` wins, ties go to the
//! lowest `response_time_ms`, remaining ties go to registration order.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, ValidationError, ValidationResult};

// =============================================================================
// Endpoint Type
// =============================================================================

/// Environment classification of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum EndpointType {
    /// Production gateway.
    #[default]
    Production,
    /// Staging gateway.
    Staging,
    /// Development gateway.
    Development,
    /// Gateway on the local machine.
    Local,
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointType::Production => write!(f, "production"),
            EndpointType::Staging => write!(f, "staging"),
            EndpointType::Development => write!(f, "development"),
            EndpointType::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for EndpointType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(EndpointType::Production),
            "staging" => Ok(EndpointType::Staging),
            "development" | "dev" => Ok(EndpointType::Development),
            "local" => Ok(EndpointType::Local),
            other => Err(CoreError::UnknownEndpointType(other.to_string())),
        }
    }
}

// =============================================================================
// Endpoint Configuration
// =============================================================================

/// Identity and policy for one gateway instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EndpointConfig {
    /// Unique identifier within the registry.
    pub id: String,

    /// Human-readable name shown on the dashboard.
    #[serde(default)]
    pub name: String,

    /// HTTP base URL (e.g. `https://gw.example.com`).
    pub url: String,

    /// Bearer credential. Never serialized outward.
    #[serde(default, skip_serializing)]
    #[ts(skip)]
    pub credential: Option<String>,

    /// Environment classification.
    #[serde(rename = "type", default)]
    pub kind: EndpointType,

    /// Disabled endpoints are never probed nor selected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Higher is preferred.
    #[serde(default)]
    pub priority: i32,

    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl EndpointConfig {
    /// Creates an enabled endpoint with priority 0 and no credential.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        EndpointConfig {
            name: id.clone(),
            id,
            url: url.into(),
            credential: None,
            kind: EndpointType::default(),
            enabled: true,
            priority: 0,
            tags: Vec::new(),
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the bearer credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Sets the selection priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the environment classification.
    pub fn with_kind(mut self, kind: EndpointType) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the endpoint as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Checks the fields that need no network to verify.
    ///
    /// An empty `id` is allowed; the registry assigns one on registration.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.url.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "url".to_string(),
            });
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                reason: format!("expected http:// or https://, got '{}'", self.url),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Endpoint Health
// =============================================================================

/// Probe-derived status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum EndpointStatus {
    /// Last probe succeeded.
    Online,
    /// Last probe failed, error budget not yet spent.
    Offline,
    /// Consecutive failures reached the configured maximum.
    Error,
    /// Never probed.
    #[default]
    Unknown,
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointStatus::Online => write!(f, "online"),
            EndpointStatus::Offline => write!(f, "offline"),
            EndpointStatus::Error => write!(f, "error"),
            EndpointStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Counters the gateway reports in its health response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct BackendStats {
    /// Gateway uptime in seconds.
    #[serde(default)]
    pub uptime: Option<f64>,
    /// Dashboard clients connected to the gateway.
    #[serde(default)]
    pub connected_clients: Option<u64>,
    /// Agents currently running.
    #[serde(default)]
    pub active_agents: Option<u64>,
    /// Chat sessions currently open.
    #[serde(default)]
    pub active_sessions: Option<u64>,
    /// Scheduled cron jobs.
    #[serde(default)]
    pub cron_jobs: Option<u64>,
    /// Gateway version string.
    #[serde(default)]
    pub version: Option<String>,
}

/// Ephemeral health measurement for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EndpointHealth {
    /// Current status.
    pub status: EndpointStatus,

    /// Round-trip time of the last successful probe.
    pub response_time_ms: Option<u64>,

    /// When the last probe settled.
    #[ts(as = "Option<String>")]
    pub last_checked_at: Option<DateTime<Utc>>,

    /// Failed probes since the last success.
    pub consecutive_errors: u32,

    /// Message of the last failed probe.
    pub last_error: Option<String>,

    /// Counters from the last successful probe.
    pub stats: BackendStats,
}

impl EndpointHealth {
    /// Applies a successful probe.
    pub fn record_success(&mut self, response_time_ms: u64, stats: BackendStats, at: DateTime<Utc>) {
        self.status = EndpointStatus::Online;
        self.response_time_ms = Some(response_time_ms);
        self.last_checked_at = Some(at);
        self.consecutive_errors = 0;
        self.last_error = None;
        self.stats = stats;
    }

    /// Applies a failed probe.
    ///
    /// Status becomes `Offline` until `consecutive_errors` reaches
    /// `max_consecutive_errors`, then `Error`. A max of 0 behaves like 1.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
        max_consecutive_errors: u32,
    ) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_checked_at = Some(at);
        self.last_error = Some(error.into());
        self.status = if self.consecutive_errors >= max_consecutive_errors.max(1) {
            EndpointStatus::Error
        } else {
            EndpointStatus::Offline
        };
    }

    /// Returns true if the last probe succeeded.
    pub fn is_online(&self) -> bool {
        self.status == EndpointStatus::Online
    }
}

// =============================================================================
// Snapshot + Selection
// =============================================================================

/// An endpoint's configuration paired with its latest health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EndpointSnapshot {
    /// Endpoint configuration.
    pub config: EndpointConfig,
    /// Latest health measurement.
    pub health: EndpointHealth,
}

impl EndpointSnapshot {
    /// Wraps a config with fresh `unknown` health.
    pub fn new(config: EndpointConfig) -> Self {
        EndpointSnapshot {
            config,
            health: EndpointHealth::default(),
        }
    }

    /// Returns true if this endpoint may be selected as active.
    pub fn is_selectable(&self) -> bool {
        self.config.enabled && self.health.is_online()
    }
}

/// Picks the best endpoint among `enabled && online` ones.
///
/// Priority descending, then lowest response time, then first in iteration
/// order.
pub fn select_best<'a, I>(endpoints: I) -> Option<&'a EndpointSnapshot>
where
    I: IntoIterator<Item = &'a EndpointSnapshot>,
{
    endpoints
        .into_iter()
        .filter(|e| e.is_selectable())
        .min_by_key(|e| {
            (
                Reverse(e.config.priority),
                e.health.response_time_ms.unwrap_or(u64::MAX),
            )
        })
}

// =============================================================================
// System Health
// =============================================================================

/// Overall verdict across all endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum SystemStatus {
    /// An active endpoint exists and every enabled endpoint is online.
    Healthy,
    /// An active endpoint exists but some enabled endpoints are not online.
    Degraded,
    /// No online active endpoint.
    Down,
}

/// Aggregate, read-only view over the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SystemHealth {
    /// Overall verdict.
    pub status: SystemStatus,
    /// Registered endpoints.
    pub total_endpoints: usize,
    /// Enabled endpoints.
    pub enabled_endpoints: usize,
    /// Endpoints in `online`.
    pub online: usize,
    /// Endpoints in `offline`.
    pub offline: usize,
    /// Endpoints in `error`.
    pub error: usize,
    /// Endpoints in `unknown`.
    pub unknown: usize,
    /// Currently active endpoint.
    pub active_endpoint_id: Option<String>,
    /// Mean response time over online endpoints.
    pub average_response_time_ms: Option<u64>,
    /// Sum of `activeAgents` over online endpoints.
    pub total_agents: u64,
    /// Sum of `activeSessions` over online endpoints.
    pub total_sessions: u64,
    /// Sum of `connectedClients` over online endpoints.
    pub total_connected_clients: u64,
}

impl SystemHealth {
    /// Summarizes a set of endpoint snapshots.
    pub fn summarize<'a, I>(endpoints: I, active_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = &'a EndpointSnapshot>,
    {
        let mut summary = SystemHealth {
            status: SystemStatus::Down,
            total_endpoints: 0,
            enabled_endpoints: 0,
            online: 0,
            offline: 0,
            error: 0,
            unknown: 0,
            active_endpoint_id: active_id.map(str::to_string),
            average_response_time_ms: None,
            total_agents: 0,
            total_sessions: 0,
            total_connected_clients: 0,
        };

        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;
        let mut active_online = false;
        let mut enabled_not_online = 0usize;

        for endpoint in endpoints {
            summary.total_endpoints += 1;
            if endpoint.config.enabled {
                summary.enabled_endpoints += 1;
                if !endpoint.health.is_online() {
                    enabled_not_online += 1;
                }
            }

            match endpoint.health.status {
                EndpointStatus::Online => summary.online += 1,
                EndpointStatus::Offline => summary.offline += 1,
                EndpointStatus::Error => summary.error += 1,
                EndpointStatus::Unknown => summary.unknown += 1,
            }

            if endpoint.health.is_online() {
                if let Some(ms) = endpoint.health.response_time_ms {
                    latency_sum += ms;
                    latency_count += 1;
                }
                let stats = &endpoint.health.stats;
                summary.total_agents += stats.active_agents.unwrap_or(0);
                summary.total_sessions += stats.active_sessions.unwrap_or(0);
                summary.total_connected_clients += stats.connected_clients.unwrap_or(0);

                if Some(endpoint.config.id.as_str()) == active_id {
                    active_online = true;
                }
            }
        }

        if latency_count > 0 {
            summary.average_response_time_ms = Some(latency_sum / latency_count);
        }

        summary.status = if !active_online {
            SystemStatus::Down
        } else if enabled_not_online == 0 {
            SystemStatus::Healthy
        } else {
            SystemStatus::Degraded
        };

        summary
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
