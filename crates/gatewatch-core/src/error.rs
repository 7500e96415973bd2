//! # Error Types
//!
//! Domain-specific error types for gatewatch-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  gatewatch-core errors (this file)                                     │
//! │  ├── CoreError        - Parsing of closed enumerations                 │
//! │  └── ValidationError  - Endpoint configuration checks                  │
//! │                                                                         │
//! │  gatewatch-store errors (separate crate)                               │
//! │  └── StoreError       - Persistence, cache fetch, replay failures      │
//! │                                                                         │
//! │  gatewatch-sync errors (separate crate)                                │
//! │  └── SyncError        - Config, transport, protocol, health            │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → status fields         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An event type outside the closed set of stream event types.
    ///
    /// ## When This Occurs
    /// - Gateway sends a newer event type this client does not know
    /// - A frame is not an event at all (pong, auth ack)
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A priority string that is not low/normal/high/critical.
    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    /// An endpoint type string that is not a known environment.
    #[error("Unknown endpoint type: {0}")]
    UnknownEndpointType(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., URL without a scheme).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Convenience type alias for validation Results.
pub type ValidationResult<T> = Result<T, ValidationError>;
