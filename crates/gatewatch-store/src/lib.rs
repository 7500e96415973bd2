//! # gatewatch-store: Local Persistence for Gatewatch
//!
//! The tiered cache and the offline write queue, over a pluggable
//! persistent key/value store.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Gatewatch Data Flow                              │
//! │                                                                         │
//! │  Dashboard read / event router / Gatewatch::write                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 gatewatch-store (THIS CRATE)                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  TieredCache  │    │   SyncQueue   │    │ NetworkSignal│  │   │
//! │  │   │  (tiered.rs)  │    │(sync_queue.rs)│    │ (network.rs) │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ fast HashMap  │    │ FIFO + worker │◄───│ online/off   │  │   │
//! │  │   │ single-flight │    │ WriteReplayer │    │              │  │   │
//! │  │   └───────┬───────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │           └──────────┬─────────┘                               │   │
//! │  │                      ▼                                         │   │
//! │  │           dyn PersistentStore                                  │   │
//! │  │           ├── SqliteStore (sqlite.rs, migrations)              │   │
//! │  │           └── MemoryStore                                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gatewatch_store::{CacheConfig, CacheOptions, SqliteStore, StoreConfig, TieredCache};
//!
//! let store = Arc::new(SqliteStore::new(StoreConfig::new("gatewatch.db")).await?);
//! let cache = TieredCache::new(CacheConfig::default(), store);
//!
//! let agents: Vec<Agent> = cache
//!     .with_cache("agents:all", CacheOptions::new(Duration::from_secs(60)), fetch_agents)
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod network;
pub mod persistent;
pub mod sqlite;
pub mod sync_queue;
pub mod tiered;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use network::{NetworkObserver, NetworkSignal};
pub use persistent::{MemoryStore, PersistentStore};
pub use sqlite::{SqliteStore, StoreConfig};
pub use sync_queue::{DrainReport, SyncQueue, SyncQueueHandle, SyncQueueWorker, WriteReplayer};
pub use tiered::{CacheConfig, CacheOptions, CacheStats, TieredCache};
