//! # Gatewatch Orchestrator
//!
//! Builds every component from one [`GatewatchConfig`] and runs them as a
//! unit.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Gatewatch Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────┐  active endpoint   ┌──────────────────────────┐  │
//! │  │ EndpointRegistry │ ─────────────────► │ ConnectionManager        │  │
//! │  │ probes, failover │      (watch)       │ auth, ping, backoff      │  │
//! │  └──────────────────┘                    └────────────┬─────────────┘  │
//! │                                                       │                 │
//! │                            inbound events             │  phase          │
//! │                   ┌───────────────────────────────────┤                 │
//! │                   ▼                                   ▼                 │
//! │  ┌──────────────────┐   ┌──────────┐      ┌──────────────────────────┐ │
//! │  │ EventRouter      │──►│ EventBus │      │ NetworkSignal            │ │
//! │  │ → TieredCache    │   └──────────┘      │ online = connected       │ │
//! │  └──────────────────┘                     └────────────┬─────────────┘ │
//! │                                                        ▼               │
//! │  write(key, payload) ── online ──► GatewayReplayer   SyncQueueWorker   │
//! │                    └─── offline/failed ──► SyncQueue ──► drain         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gatewatch_core::cache::QueuedWrite;
use gatewatch_core::clock::{Clock, SystemClock};
use gatewatch_core::connection::ConnectionState;
use gatewatch_core::endpoint::{EndpointSnapshot, SystemHealth};
use gatewatch_store::{
    CacheStats, DrainReport, MemoryStore, NetworkObserver, NetworkSignal, PersistentStore,
    SyncQueue, SyncQueueHandle, SyncQueueWorker, TieredCache,
};

use crate::config::GatewatchConfig;
use crate::connection::{ConnectionConfig, ConnectionHandle, ConnectionManager};
use crate::error::{SyncError, SyncResult};
use crate::event_bus::EventBus;
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::invalidation::EventRouter;
use crate::registry::{EndpointRegistry, RegistryConfig};
use crate::writer::GatewayReplayer;

// =============================================================================
// Status
// =============================================================================

/// Snapshot of the whole layer, as served by the monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewatchStatus {
    /// Whether `start()` has run.
    pub running: bool,

    /// Event stream state.
    pub connection: ConnectionState,

    /// Aggregate endpoint health.
    pub system: SystemHealth,

    /// Every registered endpoint.
    pub endpoints: Vec<EndpointSnapshot>,

    /// Cache counters.
    pub cache: CacheStats,

    /// Writes waiting for the network.
    pub pending_writes: usize,
}

/// How a write was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Delivered to the active endpoint.
    Sent,
    /// Queued for replay; carries the queued write id.
    Queued(String),
}

// =============================================================================
// Gatewatch
// =============================================================================

/// Components that exist only while running.
struct Running {
    connection: ConnectionHandle,
    queue: SyncQueue,
    queue_handle: SyncQueueHandle,
    replayer: GatewayReplayer,
    forwarder: JoinHandle<()>,
}

/// The assembled resilience layer.
///
/// ## Usage
/// ```rust,ignore
/// let gatewatch = GatewatchBuilder::new(config)
///     .with_store(Arc::new(SqliteStore::new(StoreConfig::new(path)).await?))
///     .build()?;
///
/// gatewatch.start().await?;
/// gatewatch.bus().on_any(|event| println!("{}", event.kind)).await;
/// gatewatch.write("sessions/s1/messages", json!({"text": "hi"})).await?;
/// ```
pub struct Gatewatch {
    config: Arc<GatewatchConfig>,
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    cache: TieredCache,
    bus: EventBus,
    registry: EndpointRegistry,
    network: NetworkSignal,
    running: Mutex<Option<Running>>,
}

impl Gatewatch {
    /// Starts health checks, the event stream and the queue worker.
    /// Calling it while running is a no-op.
    pub async fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Gatewatch already running");
            return Ok(());
        }

        info!(
            gateway = %self.config.gateway.url,
            backups = self.config.backups.len(),
            "Starting Gatewatch"
        );

        for endpoint in self.config.endpoints() {
            let id = endpoint.id.clone();
            if let Err(e) = self.registry.register(endpoint).await {
                warn!(endpoint_id = %id, error = %e, "Skipping endpoint");
            }
        }
        self.registry.start().await;

        let swept = self.cache.sweep().await;
        if swept > 0 {
            info!(swept, "Removed expired cache entries");
        }

        let queue = SyncQueue::open_with_clock(
            self.store.clone(),
            &self.config.queue.namespace,
            self.clock.clone(),
        )
        .await;
        let replayer = GatewayReplayer::new(
            self.registry.clone(),
            Duration::from_secs(self.config.queue.write_timeout_secs),
        )?;

        let (manager, connection) = ConnectionManager::new(
            ConnectionConfig::from(&self.config.connection),
            self.registry.clone(),
            self.bus.clone(),
        );
        manager
            .with_router(EventRouter::new(self.cache.clone()))
            .with_clock(self.clock.clone())
            .spawn();

        let forwarder = tokio::spawn(forward_phase(connection.clone(), self.network.clone()));

        let queue_handle = SyncQueueWorker::spawn(
            queue.clone(),
            Arc::new(replayer.clone()),
            &self.network,
            Duration::from_secs(self.config.queue.retry_interval_secs),
        );

        connection.connect().await?;

        *running = Some(Running {
            connection,
            queue,
            queue_handle,
            replayer,
            forwarder,
        });

        info!("Gatewatch started");
        Ok(())
    }

    /// Stops every background task. Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!("Shutting down Gatewatch");

        if let Err(e) = running.connection.disconnect().await {
            debug!(error = %e, "Connection manager already stopped");
        }
        running.connection.shutdown().await;
        running.queue_handle.shutdown().await;
        running.forwarder.abort();
        self.registry.stop().await;
        self.network.set_online(false);

        info!("Gatewatch stopped");
    }

    /// Sends a write now when online; queues it otherwise or on failure.
    pub async fn write(
        &self,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> SyncResult<WriteOutcome> {
        let (queue, replayer) = {
            let running = self.running.lock().await;
            let running = running
                .as_ref()
                .ok_or_else(|| SyncError::Internal("Gatewatch not started".into()))?;
            (running.queue.clone(), running.replayer.clone())
        };

        let write = QueuedWrite::new(key, payload, self.clock.now());
        if self.network.is_online() {
            match replayer.deliver(&write).await {
                Ok(()) => return Ok(WriteOutcome::Sent),
                Err(e) => warn!(key = %write.key, error = %e, "Direct write failed, queueing"),
            }
        }

        let queued = queue.enqueue(write.key, write.payload).await;
        debug!(write_id = %queued.id, key = %queued.key, "Write queued");
        Ok(WriteOutcome::Queued(queued.id))
    }

    /// Drains the write queue now.
    pub async fn flush(&self) -> SyncResult<DrainReport> {
        let handle = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.queue_handle.clone())
            .ok_or_else(|| SyncError::Internal("Gatewatch not started".into()))?;
        Ok(handle.flush().await?)
    }

    /// Current status snapshot.
    pub async fn status(&self) -> GatewatchStatus {
        let (running, connection, pending_writes) = match self.running.lock().await.as_ref() {
            Some(r) => (true, r.connection.state(), r.queue.len().await),
            None => (false, ConnectionState::default(), 0),
        };

        GatewatchStatus {
            running,
            connection,
            system: self.registry.system_health().await,
            endpoints: self.registry.endpoints().await,
            cache: self.cache.stats().await,
            pending_writes,
        }
    }

    /// Handle to the connection manager, while running.
    pub async fn connection(&self) -> Option<ConnectionHandle> {
        self.running.lock().await.as_ref().map(|r| r.connection.clone())
    }

    /// Returns the cached value for `key` or fetches it once. TTL and tag
    /// come from the `[cache.ttl]` class matching the key's prefix.
    pub async fn cached<T, F, Fut, E>(&self, key: &str, fetcher: F) -> SyncResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let options = self.config.cache.options_for_key(key);
        Ok(self.cache.with_cache(key, options, fetcher).await?)
    }

    /// The tiered cache.
    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// The event bus inbound events are published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The endpoint registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Online signal, driven by the connection phase.
    pub fn network(&self) -> &NetworkSignal {
        &self.network
    }

    /// The validated configuration.
    pub fn config(&self) -> &GatewatchConfig {
        &self.config
    }
}

/// Mirrors the connection phase into the network signal until the manager
/// stops.
async fn forward_phase(connection: ConnectionHandle, network: NetworkSignal) {
    let mut states = connection.subscribe();
    loop {
        let online = states.borrow_and_update().is_connected();
        network.set_online(online);
        if states.changed().await.is_err() {
            break;
        }
    }
    network.set_online(false);
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`Gatewatch`].
pub struct GatewatchBuilder {
    config: GatewatchConfig,
    store: Option<Arc<dyn PersistentStore>>,
    probe: Option<Arc<dyn HealthProbe>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewatchBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: GatewatchConfig) -> Self {
        GatewatchBuilder {
            config,
            store: None,
            probe: None,
            clock: None,
        }
    }

    /// Sets the persistent store (default: in-memory).
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the health probe (default: HTTP).
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sets the clock (default: system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the config and assembles the components.
    pub fn build(self) -> SyncResult<Gatewatch> {
        self.config.validate()?;

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpHealthProbe::new(
                self.config.health.timeout(),
                self.config.health.path.clone(),
            )?),
        };

        let cache = TieredCache::with_clock(
            self.config.cache.cache_config(),
            store.clone(),
            clock.clone(),
        );
        let registry = EndpointRegistry::with_clock(
            probe,
            RegistryConfig::from(&self.config.health),
            clock.clone(),
        );

        Ok(Gatewatch {
            config: Arc::new(self.config),
            store,
            clock,
            cache,
            bus: EventBus::new(),
            registry,
            network: NetworkSignal::new(false),
            running: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupGateway;
    use crate::testing::{MockGateway, ScriptedProbe};
    use gatewatch_core::clock::ManualClock;
    use gatewatch_core::connection::ConnectionPhase;
    use gatewatch_core::endpoint::EndpointType;
    use gatewatch_core::event::RealtimeEventType;
    use gatewatch_store::CacheOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(primary: &str, backup: Option<&str>) -> GatewatchConfig {
        let mut config = GatewatchConfig::default();
        config.gateway.id = "a".into();
        config.gateway.url = primary.into();
        config.gateway.token = Some("tok".into());
        config.connection.initial_backoff_ms = 20;
        config.connection.max_backoff_secs = 1;
        if let Some(url) = backup {
            config.backups.push(BackupGateway {
                id: "b".into(),
                url: url.into(),
                token: None,
                priority: 50,
                enabled: true,
                kind: EndpointType::default(),
                tags: Vec::new(),
            });
        }
        config
    }

    async fn wait_connected_to(gatewatch: &Gatewatch, id: &str) -> ConnectionState {
        let mut rx = gatewatch.connection().await.unwrap().subscribe();
        let state = tokio::time::timeout(
            WAIT,
            rx.wait_for(|s| s.is_connected() && s.bound_endpoint_id.as_deref() == Some(id)),
        )
        .await
        .expect("timed out waiting for connection")
        .unwrap()
        .clone();
        state
    }

    async fn wait_online(network: &NetworkSignal, online: bool) {
        let mut rx = network.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|v| *v == online))
            .await
            .expect("timed out waiting for network signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = GatewatchConfig::default();
        config.gateway.url = "not a url".into();
        assert!(GatewatchBuilder::new(config).build().is_err());
    }

    #[tokio::test]
    async fn test_write_before_start_fails() {
        let gatewatch = GatewatchBuilder::new(GatewatchConfig::default())
            .with_probe(Arc::new(ScriptedProbe::default()))
            .build()
            .unwrap();
        assert!(gatewatch.write("k", json!({})).await.is_err());
        assert!(!gatewatch.status().await.running);
    }

    #[tokio::test]
    async fn test_cached_uses_class_ttl() {
        let clock = Arc::new(ManualClock::default());
        let mut config = GatewatchConfig::default();
        config.cache.ttl.sessions = 10;
        let gatewatch = GatewatchBuilder::new(config)
            .with_probe(Arc::new(ScriptedProbe::default()))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, String>(json!({"fetch": n}))
            }
        };

        let first: serde_json::Value = gatewatch
            .cached("sessions:list", fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(first["fetch"], 1);

        clock.advance(Duration::from_secs(9));
        let cached: serde_json::Value = gatewatch
            .cached("sessions:list", fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(cached["fetch"], 1);

        // Tagged with the class, so a sessions purge drops it.
        assert_eq!(gatewatch.cache().invalidate("sessions").await, 1);

        gatewatch
            .cached::<serde_json::Value, _, _, _>("sessions:list", fetch(calls.clone()))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));
        let refetched: serde_json::Value = gatewatch
            .cached("sessions:list", fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(refetched["fetch"], 3);
    }

    #[tokio::test]
    async fn test_start_connects_and_routes_events() {
        let gw = MockGateway::start().await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a", Some(5));

        let gatewatch = GatewatchBuilder::new(config(&gw.url(), None))
            .with_probe(probe)
            .build()
            .unwrap();
        gatewatch
            .cache()
            .set_value(
                "sessions:list",
                json!([{"key": "s1", "messageCount": 1}]),
                CacheOptions::new(Duration::from_secs(60)).tags(["sessions"]),
            )
            .await;

        gatewatch.start().await.unwrap();
        gatewatch.start().await.unwrap();
        wait_connected_to(&gatewatch, "a").await;
        wait_online(gatewatch.network(), true).await;
        gw.wait_for_frames("auth", 1).await;
        assert_eq!(gw.sessions(), 1);

        let mut events = gatewatch.bus().subscribe();
        gw.push(json!({
            "type": "message_sent",
            "data": {"sessionKey": "s1", "messageCount": 5, "timestamp": "2026-01-01T00:00:00Z"}
        }));
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind, RealtimeEventType::MessageSent);
        assert_eq!(
            gatewatch.cache().get_value("sessions:list").await.unwrap()[0]["messageCount"],
            json!(5)
        );

        let status = gatewatch.status().await;
        assert!(status.running);
        assert!(status.connection.is_connected());
        assert_eq!(status.system.active_endpoint_id.as_deref(), Some("a"));
        assert_eq!(status.endpoints.len(), 1);

        gatewatch.shutdown().await;
        gatewatch.shutdown().await;
        assert!(!gatewatch.network().is_online());
        assert!(!gatewatch.status().await.running);
    }

    #[tokio::test]
    async fn test_write_sends_online_and_queues_offline() {
        let gw = MockGateway::start().await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a", Some(5));

        let gatewatch = GatewatchBuilder::new(config(&gw.url(), None))
            .with_probe(probe)
            .build()
            .unwrap();
        gatewatch.start().await.unwrap();
        wait_online(gatewatch.network(), true).await;

        let outcome = gatewatch
            .write("sessions/s1/messages", json!({"text": "one"}))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Sent);
        assert_eq!(gw.writes().await.len(), 1);

        // Gateway refuses writes: the direct path falls back to the queue.
        gw.set_write_status(500);
        let outcome = gatewatch
            .write("sessions/s1/messages", json!({"text": "two"}))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(gatewatch.status().await.pending_writes, 1);

        gw.set_write_status(200);
        let report = gatewatch.flush().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 0);

        let writes = gw.writes().await;
        assert_eq!(writes.last().unwrap().1, json!({"text": "two"}));

        gatewatch.shutdown().await;
    }

    #[tokio::test]
    async fn test_failover_rebinds_without_giving_up() {
        let gw_a = MockGateway::start().await;
        let gw_b = MockGateway::start().await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a", Some(5));
        probe.set("b", Some(5));

        let gatewatch = GatewatchBuilder::new(config(&gw_a.url(), Some(&gw_b.url())))
            .with_probe(probe.clone())
            .build()
            .unwrap();
        gatewatch.start().await.unwrap();
        wait_connected_to(&gatewatch, "a").await;

        let mut failovers = gatewatch.registry().subscribe_failover();
        probe.set("a", None);
        gatewatch.registry().run_health_cycle().await;

        let failover = failovers.recv().await.unwrap();
        assert_eq!(failover.from.as_deref(), Some("a"));
        assert_eq!(failover.to.as_deref(), Some("b"));

        let state = wait_connected_to(&gatewatch, "b").await;
        assert!(!state.gave_up);
        assert_eq!(state.phase, ConnectionPhase::Connected);

        // Backups inherit the primary credential.
        let auth = gw_b.wait_for_frames("auth", 1).await;
        assert_eq!(auth[0]["token"], "tok");

        gatewatch.shutdown().await;
    }
}
