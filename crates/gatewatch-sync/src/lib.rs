//! # gatewatch-sync: Gateway Connection, Failover and Orchestration
//!
//! Everything that talks to the Gateway: the event stream, health probes,
//! failover between endpoints, cache effects of inbound events and replay
//! of queued writes.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Gatewatch Sync Layer                             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  Gatewatch (Main Orchestrator)                   │  │
//! │  │                                                                  │  │
//! │  │  Registers gateways, starts probes, stream and queue worker     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │EndpointRegistry│  │ConnectionMgr   │  │  GatewayReplayer       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Health probes  │─►│ WebSocket with │  │ POSTs queued writes    │    │
//! │  │ Best endpoint  │  │ auth, ping and │  │ to the active endpoint │    │
//! │  │ Failover       │  │ backoff        │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │                              ▼                                          │
//! │                     ┌────────────────┐   ┌────────────────────────┐    │
//! │                     │  EventRouter   │──►│       EventBus         │    │
//! │                     │ cache effects  │   │ typed + catch-all      │    │
//! │                     └────────────────┘   └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `Gatewatch` orchestrator and its builder
//! - [`config`] - TOML + environment configuration
//! - [`connection`] - Event stream client
//! - [`error`] - Sync error types
//! - [`event_bus`] - Typed publish/subscribe
//! - [`health`] - HTTP health probe
//! - [`invalidation`] - Cache effects of inbound events
//! - [`protocol`] - Stream frames and gateway URLs
//! - [`reconnect`] - Backoff schedule
//! - [`registry`] - Endpoint registry and failover
//! - [`writer`] - Queued write replay
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gatewatch_sync::{GatewatchBuilder, GatewatchConfig};
//!
//! let config = GatewatchConfig::load_or_default(None);
//! let gatewatch = GatewatchBuilder::new(config).build()?;
//! gatewatch.start().await?;
//!
//! let status = gatewatch.status().await;
//! println!("Connected: {}", status.connection.is_connected());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod health;
pub mod invalidation;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{Gatewatch, GatewatchBuilder, GatewatchStatus, WriteOutcome};
pub use config::{
    BackupGateway, CacheSettings, ConnectionSettings, GatewatchConfig, GatewaySettings,
    HealthSettings, QueueSettings, StatusSettings, StorageSettings, TtlTable,
};
pub use connection::{ConnectionConfig, ConnectionHandle, ConnectionManager};
pub use error::{SyncError, SyncResult};
pub use event_bus::{EventBus, EventHandler, HandlerId};
pub use health::{HealthProbe, HttpHealthProbe, ProbeReport};
pub use invalidation::{CacheEffect, EventRouter};
pub use protocol::{ClientMessage, InboundFrame};
pub use reconnect::ReconnectPolicy;
pub use registry::{EndpointPatch, EndpointRegistry, FailoverEvent, FailoverReason, RegistryConfig};
pub use writer::GatewayReplayer;
