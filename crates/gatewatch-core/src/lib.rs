//! # gatewatch-core: Pure Types and Rules for Gatewatch
//!
//! Domain types and decision logic shared by the store, the sync engine and
//! the monitor binary. Nothing in here performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Gatewatch Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  Dashboard / gatewatch-monitor                  │   │
//! │  │     reads cache, subscribes to events, queues offline writes    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │     gatewatch-sync (registry, connection, event bus, router)   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        gatewatch-store (tiered cache, sync queue, SQLite)       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ gatewatch-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌────────────┐  ┌──────────┐  │   │
//! │  │   │ endpoint  │  │   cache   │  │ connection │  │  event   │  │   │
//! │  │   │ health    │  │  entries  │  │   state    │  │  types   │  │   │
//! │  │   │ selection │  │  eviction │  │            │  │          │  │   │
//! │  │   └───────────┘  └───────────┘  └────────────┘  └──────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`endpoint`] - Endpoint config, health state machine, best-endpoint selection
//! - [`cache`] - Cache entries, priorities, eviction order, queued writes
//! - [`connection`] - Connection phase and state snapshot
//! - [`event`] - Realtime event wire types
//! - [`clock`] - Injectable time source
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use gatewatch_core::endpoint::{select_best, EndpointConfig, EndpointSnapshot};
//!
//! let mut a = EndpointSnapshot::new(EndpointConfig::new("a", "http://a.local").with_priority(1));
//! let mut b = EndpointSnapshot::new(EndpointConfig::new("b", "http://b.local").with_priority(5));
//! a.health.record_success(40, Default::default(), chrono::Utc::now());
//! b.health.record_success(90, Default::default(), chrono::Utc::now());
//!
//! let best = select_best([&a, &b]).unwrap();
//! assert_eq!(best.config.id, "b");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod clock;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod event;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cache::{CacheEntry, Priority, QueuedWrite, ResourceClass};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionPhase, ConnectionState};
pub use endpoint::{
    BackendStats, EndpointConfig, EndpointHealth, EndpointSnapshot, EndpointStatus, EndpointType,
    SystemHealth, SystemStatus,
};
pub use error::{CoreError, ValidationError};
pub use event::{EventData, EventSource, RealtimeEvent, RealtimeEventType};
