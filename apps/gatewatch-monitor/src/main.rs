//! # Gatewatch Monitor
//!
//! Headless runner for the Gatewatch resilience layer.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info)                                    │
//! │  2. GatewatchConfig: defaults → gatewatch.toml → GATEWATCH_* env        │
//! │  3. store: SQLite at storage.path / data dir, or in-memory              │
//! │  4. Gatewatch::start (probes, stream, queue worker)                     │
//! │  5. status server on status.bind_addr:status.port                       │
//! │  6. Ctrl+C / SIGTERM → graceful shutdown                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod status;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatewatch_store::{MemoryStore, PersistentStore, SqliteStore, StoreConfig};
use gatewatch_sync::{GatewatchBuilder, GatewatchConfig};

use crate::status::StatusServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Gatewatch monitor...");

    let config = GatewatchConfig::load_or_default(None);
    info!(
        gateway = %config.gateway.url,
        backups = config.backups.len(),
        "Configuration loaded"
    );

    let store = open_store(&config).await?;

    let gatewatch = Arc::new(
        GatewatchBuilder::new(config.clone())
            .with_store(store)
            .build()?,
    );

    gatewatch
        .bus()
        .on_any(|event| {
            info!(
                event_type = %event.kind,
                source = ?event.source,
                session_key = ?event.data.session_key,
                status = ?event.data.status,
                "Gateway event"
            );
        })
        .await;

    let mut failovers = gatewatch.registry().subscribe_failover();
    tokio::spawn(async move {
        while let Ok(event) = failovers.recv().await {
            warn!(
                from = ?event.from,
                to = ?event.to,
                reason = %event.reason,
                "Failover"
            );
        }
    });

    gatewatch.start().await?;

    let status = if config.status.enabled {
        Some(
            StatusServer::new(gatewatch.clone(), config.status.bind_address())
                .start()
                .await?,
        )
    } else {
        None
    };

    shutdown_signal().await;

    if let Some(handle) = status {
        handle.shutdown().await;
    }
    gatewatch.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show per-frame traffic
/// - `RUST_LOG=gatewatch_sync=trace` - Trace for the sync crate only
/// - Default: INFO level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Opens the persistent tier.
///
/// Falls back to memory when no data directory can be determined.
async fn open_store(
    config: &GatewatchConfig,
) -> Result<Arc<dyn PersistentStore>, Box<dyn std::error::Error>> {
    if config.storage.in_memory {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let Some(path) = config.database_path() else {
        warn!("No data directory available, using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    Ok(Arc::new(SqliteStore::new(StoreConfig::new(path)).await?))
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
