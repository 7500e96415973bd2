//! # Sync Error Types
//!
//! Error types for the registry, the connection and the orchestrator.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  Serialization          │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │  AuthRejected           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Registry     │  │     Health      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  UnknownEndpoint│  │  HealthCheck    │  │  Store, Channel         │ │
//! │  │  Duplicate      │  │  HttpStatus     │  │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! None of these reach dashboard readers: connection and health failures
//! surface as state fields, store failures as cache misses.

use gatewatch_core::{CoreError, ValidationError};
use gatewatch_store::StoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all sync-layer failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid gateway URL.
    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// No endpoint with this id.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// An endpoint with this id is already registered.
    #[error("Endpoint already registered: {0}")]
    DuplicateEndpoint(String),

    /// No endpoint is active.
    #[error("No active endpoint")]
    NoActiveEndpoint,

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the stream or an HTTP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Stream closed unexpectedly.
    #[error("Disconnected from gateway")]
    Disconnected,

    /// Operation timed out.
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Not connected, so the frame could not be sent.
    #[error("Not connected")]
    NotConnected,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid frame received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to (de)serialize a frame or payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Gateway rejected the auth handshake.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    // =========================================================================
    // Health Errors
    // =========================================================================
    /// Health probe failed (network or parse).
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// HTTP call returned a non-2xx status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::from(v),
            other => SyncError::InvalidMessage(other.to_string()),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            WsError::Http(response) => SyncError::ConnectionFailed(format!(
                "upgrade refused with HTTP {}",
                response.status()
            )),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if let Some(status) = err.status() {
            SyncError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// Auth rejections are not: retrying with the same credential gets the
    /// same answer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::TlsError(_)
                | SyncError::NotConnected
                | SyncError::HealthCheckFailed(_)
                | SyncError::NoActiveEndpoint
        ) || matches!(self, SyncError::HttpStatus { status, .. } if *status >= 500)
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_) | SyncError::SerializationFailed(_)
        )
    }

    /// Returns true if the gateway refused our credential.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::AuthRejected(_))
            || matches!(self, SyncError::HttpStatus { status: 401 | 403, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(10_000).is_retryable());
        assert!(SyncError::HttpStatus {
            status: 503,
            url: "http://gw".into()
        }
        .is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::AuthRejected("bad token".into()).is_retryable());
        assert!(!SyncError::HttpStatus {
            status: 404,
            url: "http://gw".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::AuthRejected("x".into()).is_auth_error());
        assert!(SyncError::HttpStatus {
            status: 401,
            url: String::new()
        }
        .is_auth_error());
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(SyncError::InvalidMessage("x".into()).is_protocol_error());
    }

    #[test]
    fn test_validation_maps_to_config_error() {
        let err: SyncError = ValidationError::Required {
            field: "url".into(),
        }
        .into();
        assert!(err.is_config_error());
    }
}
