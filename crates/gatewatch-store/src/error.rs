//! # Store Error Types
//!
//! Error types for persistence, cache fetches and write replay.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error / serde_json::Error / fetcher failure                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Store (gatewatch-sync) ← Surfaced to the agent             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `StoreError` is `Clone` because a single-flight fetch hands the same
//! failure to every waiter.

use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Opening the backing database failed.
    ///
    /// ## When This Occurs
    /// - Database file can't be created
    /// - File permissions issue
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A value could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The fetcher behind a cache miss failed.
    ///
    /// ## When This Occurs
    /// - Gateway unreachable during `with_cache`
    /// - Fetcher returned an error (propagated unchanged, nothing cached)
    #[error("Fetch for '{key}' failed: {reason}")]
    FetchFailed { key: String, reason: String },

    /// Replaying a queued write failed.
    #[error("Replay of '{key}' failed: {reason}")]
    ReplayFailed { key: String, reason: String },

    /// Internal store error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Creates a FetchFailed error.
    pub fn fetch(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StoreError::FetchFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a ReplayFailed error.
    pub fn replay(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StoreError::ReplayFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convert sqlx errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::Database       → StoreError::QueryFailed
/// sqlx::Error::PoolClosed     → StoreError::ConnectionFailed
/// sqlx::Error::PoolTimedOut   → StoreError::ConnectionFailed
/// Other                       → StoreError::Internal
/// ```
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => StoreError::QueryFailed(db_err.message().to_string()),
            sqlx::Error::PoolClosed => StoreError::ConnectionFailed("Pool is closed".to_string()),
            sqlx::Error::PoolTimedOut => {
                StoreError::ConnectionFailed("Timed out acquiring connection".to_string())
            }
            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
