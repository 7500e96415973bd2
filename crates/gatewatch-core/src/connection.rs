//! # Connection State
//!
//! The singleton description of the one live event stream. Only the
//! connection manager writes it; everything else reads snapshots.
//!
//! ```text
//!  ┌────────────┐ connect() ┌────────────┐  open   ┌───────────┐
//!  │Disconnected│ ────────► │ Connecting │ ──────► │ Connected │
//!  └────────────┘           └────────────┘         └─────┬─────┘
//!        ▲                        ▲                      │ close/error
//!        │ disconnect()           │ backoff elapsed      ▼
//!        │ or gave up       ┌─────┴────────┐ ◄───────────┘
//!        └───────────────── │ Reconnecting │
//!                           └──────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Phase of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ConnectionPhase {
    /// No stream and none being dialed.
    #[default]
    Disconnected,
    /// Dialing or authenticating.
    Connecting,
    /// Stream open and authenticated.
    Connected,
    /// Waiting out a backoff delay before the next dial.
    Reconnecting,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Disconnected => write!(f, "disconnected"),
            ConnectionPhase::Connecting => write!(f, "connecting"),
            ConnectionPhase::Connected => write!(f, "connected"),
            ConnectionPhase::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Snapshot of the event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: ConnectionPhase,

    /// Endpoint the stream is (or is being) bound to.
    pub bound_endpoint_id: Option<String>,

    /// When the stream last reached `Connected`.
    #[ts(as = "Option<String>")]
    pub last_connected_at: Option<DateTime<Utc>>,

    /// Stream failures since the last successful connect.
    pub consecutive_error_count: u32,

    /// Reconnect attempt currently scheduled (0 when none).
    pub reconnect_attempt: u32,

    /// Delay before the scheduled reconnect.
    pub next_retry_ms: Option<u64>,

    /// Last stream failure.
    pub last_error: Option<String>,

    /// True once the manager stopped retrying. Cleared by the next `connect()`.
    pub gave_up: bool,

    /// Agent status last reported by the gateway in an `agent_status`
    /// event (`true` = connected). Reset on every new stream.
    pub gateway_reported: Option<bool>,
}

impl ConnectionState {
    /// Returns true if the stream is open.
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Returns the terminal state reached after exhausting reconnects.
    pub fn exhausted(mut self, reason: impl Into<String>) -> Self {
        self.phase = ConnectionPhase::Disconnected;
        self.reconnect_attempt = 0;
        self.next_retry_ms = None;
        self.last_error = Some(reason.into());
        self.gave_up = true;
        self
    }
}
