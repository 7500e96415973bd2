//! # Gateway Stream Protocol
//!
//! JSON text frames exchanged over the gateway event stream, and the URLs
//! derived from an endpoint's base URL.
//!
//! ## Frames
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Gateway Stream Frames                              │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  CLIENT  ───► { "type": "auth", "token": "..." }  (if credential)      │
//! │  GATEWAY ◄─── { "type": "auth_ok" }                (optional ack)      │
//! │  GATEWAY ◄─── { "type": "auth_error", "message": "..." }               │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  CLIENT  ───► { "type": "ping" }                   every 30s           │
//! │  GATEWAY ◄─── { "type": "pong" }                                       │
//! │                                                                         │
//! │  EVENTS                                                                │
//! │  ──────                                                                │
//! │  GATEWAY ◄─── { "type": "session_update", "data": { ...,              │
//! │                  "timestamp": "2026-01-01T00:00:00Z" } }               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## URLs
//! | derived       | from `https://gw.example.com/base`          |
//! |---------------|---------------------------------------------|
//! | stream        | `wss://gw.example.com/base/ws`              |
//! | health        | `https://gw.example.com/base/health`        |
//! | write `k`     | `https://gw.example.com/base/api/k`         |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use gatewatch_core::cache::Priority;
use gatewatch_core::event::{EventData, RealtimeEvent, RealtimeEventType};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Outbound Frames
// =============================================================================

/// Frames sent by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authentication, sent once after the stream opens.
    Auth { token: String },

    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Serializes to a JSON text frame.
    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(SyncError::from)
    }

    /// Returns the frame type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Ping => "ping",
        }
    }
}

// =============================================================================
// Inbound Frames
// =============================================================================

/// A parsed gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// One of the closed set of realtime events.
    Event(RealtimeEvent),

    /// Keepalive reply.
    Pong,

    /// Credential accepted.
    AuthOk,

    /// Credential refused.
    AuthRejected { reason: String },

    /// A frame type this client does not know. Ignored.
    Unknown(String),
}

/// Shape of an event frame after its `type` is known.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    data: EventData,
    #[serde(default)]
    priority: Option<Priority>,
}

/// Parses one text frame.
///
/// Event frames must carry a `data` object with an ISO-8601 `timestamp`;
/// anything else is an [`SyncError::InvalidMessage`].
pub fn parse_frame(text: &str) -> SyncResult<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidMessage("frame has no type".into()))?
        .to_string();

    match kind.as_str() {
        "pong" => Ok(InboundFrame::Pong),
        "auth_ok" | "authenticated" => Ok(InboundFrame::AuthOk),
        "auth_error" | "auth_failed" | "unauthorized" => {
            let reason = ["message", "reason", "error"]
                .iter()
                .find_map(|field| value.get(*field).and_then(Value::as_str))
                .unwrap_or(kind.as_str())
                .to_string();
            Ok(InboundFrame::AuthRejected { reason })
        }
        other => match other.parse::<RealtimeEventType>() {
            Ok(event_type) => {
                let envelope: EventEnvelope = serde_json::from_value(value).map_err(|e| {
                    SyncError::InvalidMessage(format!("malformed {} event: {}", event_type, e))
                })?;
                Ok(InboundFrame::Event(RealtimeEvent::from_gateway(
                    event_type,
                    envelope.data,
                    envelope.priority,
                )))
            }
            Err(_) => Ok(InboundFrame::Unknown(kind)),
        },
    }
}

/// Returns true if a close code means the gateway refused the credential.
pub fn is_auth_close_code(code: u16) -> bool {
    code == 1008 || (4001..=4003).contains(&code)
}

// =============================================================================
// URL Derivation
// =============================================================================

/// Appends `suffix` to the path of `url`.
fn append_path(url: &mut Url, suffix: &str) {
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        suffix.trim_start_matches('/')
    );
    url.set_path(&joined);
}

fn parse_base(base: &str) -> SyncResult<Url> {
    let url = Url::parse(base)?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(SyncError::InvalidUrl(format!(
            "unsupported scheme '{}' in {}",
            other, base
        ))),
    }
}

/// Stream URL: `http→ws`, `https→wss`, plus `stream_path`.
pub fn stream_url(base: &str, stream_path: &str) -> SyncResult<Url> {
    let mut url = parse_base(base)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(format!("cannot derive stream URL from {}", base)))?;
    append_path(&mut url, stream_path);
    Ok(url)
}

/// Health probe URL: base plus `health_path`.
pub fn health_url(base: &str, health_path: &str) -> SyncResult<Url> {
    let mut url = parse_base(base)?;
    append_path(&mut url, health_path);
    Ok(url)
}

/// Write URL for a cache key: `<base>/api/<key>`.
pub fn write_url(base: &str, key: &str) -> SyncResult<Url> {
    let mut url = parse_base(base)?;
    append_path(&mut url, &format!("api/{}", key.trim_start_matches('/')));
    Ok(url)
}
