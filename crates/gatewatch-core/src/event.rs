//! # Realtime Events
//!
//! Events the gateway pushes over the stream, plus the internal connection
//! signals the client publishes on the same bus.
//!
//! ## Wire Shape
//! ```text
//! {
//!   "type": "session_update" | "session_created" | "session_ended"
//!         | "message_sent"   | "cron_triggered"  | "agent_status",
//!   "data": {
//!     "sessionKey":   "...",      (optional)
//!     "session":      { ... },    (optional)
//!     "messageCount": 12,         (optional)
//!     "cronJobId":    "...",      (optional)
//!     "agentId":      "...",      (optional)
//!     "status":       "...",      (optional)
//!     "timestamp":    "2026-01-01T00:00:00Z"
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::cache::Priority;
use crate::error::CoreError;

// =============================================================================
// Event Type
// =============================================================================

/// Closed set of stream event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RealtimeEventType {
    /// Fields of an existing session changed.
    SessionUpdate,
    /// A session was opened.
    SessionCreated,
    /// A session was closed.
    SessionEnded,
    /// A message was added to a session.
    MessageSent,
    /// A cron job fired.
    CronTriggered,
    /// Agent or connection status changed.
    AgentStatus,
}

impl RealtimeEventType {
    /// All event types, in wire order.
    pub const ALL: [RealtimeEventType; 6] = [
        RealtimeEventType::SessionUpdate,
        RealtimeEventType::SessionCreated,
        RealtimeEventType::SessionEnded,
        RealtimeEventType::MessageSent,
        RealtimeEventType::CronTriggered,
        RealtimeEventType::AgentStatus,
    ];

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeEventType::SessionUpdate => "session_update",
            RealtimeEventType::SessionCreated => "session_created",
            RealtimeEventType::SessionEnded => "session_ended",
            RealtimeEventType::MessageSent => "message_sent",
            RealtimeEventType::CronTriggered => "cron_triggered",
            RealtimeEventType::AgentStatus => "agent_status",
        }
    }

    /// Priority used when the frame does not carry one.
    pub fn default_priority(&self) -> Priority {
        match self {
            RealtimeEventType::SessionCreated
            | RealtimeEventType::SessionEnded
            | RealtimeEventType::AgentStatus => Priority::High,
            RealtimeEventType::SessionUpdate
            | RealtimeEventType::MessageSent
            | RealtimeEventType::CronTriggered => Priority::Normal,
        }
    }
}

impl std::fmt::Display for RealtimeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RealtimeEventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RealtimeEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Event Payload
// =============================================================================

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum EventSource {
    /// Pushed by the gateway over the stream.
    #[default]
    Gateway,
    /// Synthesized by this client (connection transitions).
    Internal,
}

/// The `data` object of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EventData {
    /// Session the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,

    /// Session fields to merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub session: Option<serde_json::Value>,

    /// New message count of the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,

    /// Cron job that fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_job_id: Option<String>,

    /// Agent the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Agent or connection status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// When the gateway emitted the event.
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,

    /// Fields this client does not interpret, kept for subscribers.
    #[serde(flatten)]
    #[ts(skip)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventData {
    /// Creates an empty payload stamped at `timestamp`.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        EventData {
            session_key: None,
            session: None,
            message_count: None,
            cron_job_id: None,
            agent_id: None,
            status: None,
            timestamp,
            extra: serde_json::Map::new(),
        }
    }
}

// =============================================================================
// Realtime Event
// =============================================================================

/// An event flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RealtimeEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: RealtimeEventType,

    /// Event payload.
    pub data: EventData,

    /// When the event happened (the payload timestamp).
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,

    /// Gateway or internal.
    pub source: EventSource,

    /// Delivery priority.
    pub priority: Priority,
}

impl RealtimeEvent {
    /// Builds a gateway event; `priority` falls back to the type default.
    pub fn from_gateway(kind: RealtimeEventType, data: EventData, priority: Option<Priority>) -> Self {
        RealtimeEvent {
            kind,
            occurred_at: data.timestamp,
            data,
            source: EventSource::Gateway,
            priority: priority.unwrap_or_else(|| kind.default_priority()),
        }
    }

    /// Builds the internal `agent_status` event for a connection transition.
    pub fn connection(connected: bool, endpoint_id: Option<&str>, at: DateTime<Utc>) -> Self {
        let mut data = EventData::at(at);
        data.status = Some(if connected { "connected" } else { "disconnected" }.to_string());
        if let Some(id) = endpoint_id {
            data.extra
                .insert("endpointId".to_string(), serde_json::Value::String(id.to_string()));
        }

        RealtimeEvent {
            kind: RealtimeEventType::AgentStatus,
            occurred_at: at,
            data,
            source: EventSource::Internal,
            priority: Priority::High,
        }
    }

    /// Returns `Some(true/false)` when this is a connection-status signal.
    ///
    /// Only `agent_status` events whose status is exactly `connected` or
    /// `disconnected` qualify; every other event is generic fan-out.
    pub fn connection_signal(&self) -> Option<bool> {
        if self.kind != RealtimeEventType::AgentStatus {
            return None;
        }
        match self.data.status.as_deref() {
            Some("connected") => Some(true),
            Some("disconnected") => Some(false),
            _ => None,
        }
    }
}
