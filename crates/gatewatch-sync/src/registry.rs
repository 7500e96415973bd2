//! # Endpoint Registry
//!
//! Candidate gateways, their health, and the single active endpoint.
//!
//! ## Health Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Registry Health Cycle                            │
//! │                                                                         │
//! │   every interval (default 30s)                                         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   probe all enabled endpoints concurrently                             │
//! │     A ──► online   B ──► offline   C ──► online     (any order)        │
//! │        │                                                                │
//! │        ▼  all probes settled                                           │
//! │   failover check (once, under one write lock)                          │
//! │     active online & enabled?  ── yes ──► keep                          │
//! │              │ no                                                       │
//! │              ▼                                                          │
//! │     active = best_endpoint()  (may be none: degraded)                  │
//! │     broadcast FailoverEvent { from, to, reason, at }                   │
//! │     publish new active on the watch channel ──► ConnectionManager      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Health transitions come only from probe outcomes. An in-flight probe for
//! an endpoint removed (or removed and re-registered) before it resolves is
//! discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gatewatch_core::clock::{Clock, SystemClock};
use gatewatch_core::endpoint::{
    select_best, EndpointConfig, EndpointHealth, EndpointSnapshot, EndpointType, SystemHealth,
};

use crate::config::HealthSettings;
use crate::error::{SyncError, SyncResult};
use crate::health::HealthProbe;

const FAILOVER_CHANNEL_CAPACITY: usize = 32;

// =============================================================================
// Configuration
// =============================================================================

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval of the periodic health cycle.
    pub health_interval: Duration,

    /// Upper bound on one probe, whatever the probe does internally.
    pub probe_timeout: Duration,

    /// Failures in a row before an endpoint is `error`.
    pub max_consecutive_errors: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_consecutive_errors: 5,
        }
    }
}

impl From<&HealthSettings> for RegistryConfig {
    fn from(settings: &HealthSettings) -> Self {
        RegistryConfig {
            health_interval: settings.interval(),
            probe_timeout: settings.timeout(),
            max_consecutive_errors: settings.max_consecutive_errors,
        }
    }
}

// =============================================================================
// Failover Events
// =============================================================================

/// Why the active endpoint changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverReason {
    /// The active endpoint stopped answering probes.
    Unhealthy,
    /// The active endpoint was removed.
    Removed,
    /// The active endpoint was disabled.
    Disabled,
    /// Switched by [`EndpointRegistry::switch_to`].
    Manual,
    /// An endpoint became available while none was active.
    Recovered,
}

impl std::fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverReason::Unhealthy => write!(f, "unhealthy"),
            FailoverReason::Removed => write!(f, "removed"),
            FailoverReason::Disabled => write!(f, "disabled"),
            FailoverReason::Manual => write!(f, "manual"),
            FailoverReason::Recovered => write!(f, "recovered"),
        }
    }
}

/// A change of the active endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverEvent {
    /// Previous active endpoint.
    pub from: Option<String>,
    /// New active endpoint (none when nothing qualifies).
    pub to: Option<String>,
    /// Cause.
    pub reason: FailoverReason,
    /// When it happened.
    pub at: DateTime<Utc>,
}

// =============================================================================
// Endpoint Patch
// =============================================================================

/// Partial update for [`EndpointRegistry::update`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    /// New display name.
    pub name: Option<String>,
    /// New base URL. Resets health to `unknown` and re-probes.
    pub url: Option<String>,
    /// New credential.
    pub credential: Option<String>,
    /// New environment classification.
    pub kind: Option<EndpointType>,
    /// Enable or disable.
    pub enabled: Option<bool>,
    /// New priority.
    pub priority: Option<i32>,
    /// Replacement tags.
    pub tags: Option<Vec<String>>,
}

// =============================================================================
// Registry State
// =============================================================================

struct Entry {
    snapshot: EndpointSnapshot,
    /// Registration generation; stale probe results are matched against it.
    epoch: u64,
}

#[derive(Default)]
struct RegistryState {
    /// Registration order (selection tie-break).
    entries: Vec<Entry>,
    active_id: Option<String>,
    next_epoch: u64,
}

impl RegistryState {
    fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.snapshot.config.id == id)
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.snapshot.config.id == id)
    }

    fn best_id(&self) -> Option<String> {
        select_best(self.entries.iter().map(|e| &e.snapshot)).map(|s| s.config.id.clone())
    }

    fn active(&self) -> Option<&EndpointSnapshot> {
        let id = self.active_id.as_deref()?;
        self.entry(id).map(|e| &e.snapshot)
    }
}

struct HealthLoop {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    failover_tx: broadcast::Sender<FailoverEvent>,
    active_tx: watch::Sender<Option<EndpointConfig>>,
    health_loop: Mutex<Option<HealthLoop>>,
}

// =============================================================================
// Endpoint Registry
// =============================================================================

/// Shared registry of candidate gateways.
///
/// ## Usage
/// ```rust,ignore
/// let registry = EndpointRegistry::new(probe, RegistryConfig::default());
/// registry.register(EndpointConfig::new("primary", "https://gw.example.com")).await?;
/// registry.start().await;
///
/// let mut failovers = registry.subscribe_failover();
/// while let Ok(event) = failovers.recv().await {
///     println!("{:?} -> {:?} ({})", event.from, event.to, event.reason);
/// }
/// ```
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl EndpointRegistry {
    /// Creates an empty registry using the system clock.
    pub fn new(probe: Arc<dyn HealthProbe>, config: RegistryConfig) -> Self {
        Self::with_clock(probe, config, Arc::new(SystemClock))
    }

    /// Creates an empty registry with an injected clock.
    pub fn with_clock(
        probe: Arc<dyn HealthProbe>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (failover_tx, _) = broadcast::channel(FAILOVER_CHANNEL_CAPACITY);
        let (active_tx, _) = watch::channel(None);

        EndpointRegistry {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                probe,
                clock,
                config,
                failover_tx,
                active_tx,
                health_loop: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Adds an endpoint and probes it once. An empty id gets a generated one.
    ///
    /// Becomes active if nothing is active and the probe succeeded.
    pub async fn register(&self, mut config: EndpointConfig) -> SyncResult<String> {
        config.validate()?;
        if config.id.trim().is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }
        let id = config.id.clone();

        {
            let mut state = self.inner.state.write().await;
            if state.entry(&id).is_some() {
                return Err(SyncError::DuplicateEndpoint(id));
            }
            let epoch = state.next_epoch;
            state.next_epoch += 1;
            state.entries.push(Entry {
                snapshot: EndpointSnapshot::new(config),
                epoch,
            });
        }
        info!(endpoint_id = %id, "Endpoint registered");

        if self.is_enabled(&id).await {
            // A failed probe is recorded in health, not returned.
            let _ = self.health_check(&id).await;
        }

        let mut state = self.inner.state.write().await;
        if state.active().is_none() {
            let selectable = state
                .entry(&id)
                .map(|e| e.snapshot.is_selectable())
                .unwrap_or(false);
            if selectable {
                self.activate(&mut state, Some(id.clone()), FailoverReason::Recovered);
            }
        }

        Ok(id)
    }

    /// Applies `patch` to an endpoint. Returns the updated snapshot.
    ///
    /// Disabling the active endpoint fails over immediately; an update that
    /// brings an endpoint online while none is active activates it.
    pub async fn update(&self, id: &str, patch: EndpointPatch) -> SyncResult<EndpointSnapshot> {
        let url_changed;
        {
            let mut state = self.inner.state.write().await;
            let entry = state
                .entry_mut(id)
                .ok_or_else(|| SyncError::UnknownEndpoint(id.to_string()))?;

            let mut config = entry.snapshot.config.clone();
            url_changed = patch.url.as_ref().is_some_and(|url| *url != config.url);
            if let Some(name) = patch.name {
                config.name = name;
            }
            if let Some(url) = patch.url {
                config.url = url;
            }
            if let Some(credential) = patch.credential {
                config.credential = Some(credential);
            }
            if let Some(kind) = patch.kind {
                config.kind = kind;
            }
            if let Some(enabled) = patch.enabled {
                config.enabled = enabled;
            }
            if let Some(priority) = patch.priority {
                config.priority = priority;
            }
            if let Some(tags) = patch.tags {
                config.tags = tags;
            }
            config.validate()?;

            entry.snapshot.config = config;
            if url_changed {
                entry.snapshot.health = EndpointHealth::default();
            }
            debug!(endpoint_id = %id, url_changed, "Endpoint updated");

            // The active endpoint's URL or credential may have changed.
            self.publish_active(&state);
        }

        if url_changed && self.is_enabled(id).await {
            let _ = self.health_check(id).await;
        }

        let mut state = self.inner.state.write().await;
        self.evaluate_failover(&mut state);

        state
            .entry(id)
            .map(|e| e.snapshot.clone())
            .ok_or_else(|| SyncError::UnknownEndpoint(id.to_string()))
    }

    /// Removes an endpoint. If it was active, the best remaining endpoint
    /// takes over.
    pub async fn remove(&self, id: &str) -> SyncResult<EndpointConfig> {
        let mut state = self.inner.state.write().await;
        let index = state
            .entries
            .iter()
            .position(|e| e.snapshot.config.id == id)
            .ok_or_else(|| SyncError::UnknownEndpoint(id.to_string()))?;
        let removed = state.entries.remove(index);
        info!(endpoint_id = %id, "Endpoint removed");

        if state.active_id.as_deref() == Some(id) {
            let best = state.best_id();
            self.activate(&mut state, best, FailoverReason::Removed);
        }

        Ok(removed.snapshot.config)
    }

    async fn is_enabled(&self, id: &str) -> bool {
        self.inner
            .state
            .read()
            .await
            .entry(id)
            .map(|e| e.snapshot.config.enabled)
            .unwrap_or(false)
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probes one endpoint and records the outcome.
    ///
    /// Returns the resulting health. A probe failure is not an error here;
    /// it shows up in the returned health.
    pub async fn health_check(&self, id: &str) -> SyncResult<EndpointHealth> {
        let (config, epoch) = {
            let state = self.inner.state.read().await;
            let entry = state
                .entry(id)
                .ok_or_else(|| SyncError::UnknownEndpoint(id.to_string()))?;
            (entry.snapshot.config.clone(), entry.epoch)
        };

        let outcome = match tokio::time::timeout(
            self.inner.config.probe_timeout,
            self.inner.probe.probe(&config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(
                self.inner.config.probe_timeout.as_millis() as u64,
            )),
        };
        let now = self.inner.clock.now();

        let mut state = self.inner.state.write().await;
        let entry = match state.entry_mut(id) {
            Some(entry) if entry.epoch == epoch => entry,
            _ => {
                debug!(endpoint_id = %id, "Discarding probe result for removed endpoint");
                return Err(SyncError::UnknownEndpoint(id.to_string()));
            }
        };

        let health = &mut entry.snapshot.health;
        match outcome {
            Ok(report) => {
                let was_online = health.is_online();
                health.record_success(report.response_time_ms, report.stats, now);
                if !was_online {
                    info!(
                        endpoint_id = %id,
                        response_time_ms = report.response_time_ms,
                        "Endpoint online"
                    );
                }
            }
            Err(e) => {
                health.record_failure(e.to_string(), now, self.inner.config.max_consecutive_errors);
                warn!(
                    endpoint_id = %id,
                    consecutive_errors = health.consecutive_errors,
                    status = ?health.status,
                    error = %e,
                    "Health check failed"
                );
            }
        }

        Ok(health.clone())
    }

    /// Probes every enabled endpoint concurrently, then runs one failover
    /// check. Returns the failover that happened, if any.
    pub async fn run_health_cycle(&self) -> Option<FailoverEvent> {
        let ids: Vec<String> = {
            let state = self.inner.state.read().await;
            state
                .entries
                .iter()
                .filter(|e| e.snapshot.config.enabled)
                .map(|e| e.snapshot.config.id.clone())
                .collect()
        };

        debug!(endpoints = ids.len(), "Running health cycle");
        join_all(ids.iter().map(|id| self.health_check(id))).await;

        let mut state = self.inner.state.write().await;
        self.evaluate_failover(&mut state)
    }

    /// Best `enabled && online` endpoint: highest priority, then lowest
    /// response time.
    pub async fn best_endpoint(&self) -> Option<EndpointSnapshot> {
        let state = self.inner.state.read().await;
        let id = state.best_id()?;
        state.entry(&id).map(|e| e.snapshot.clone())
    }

    /// Aggregate health across all endpoints.
    pub async fn system_health(&self) -> SystemHealth {
        let state = self.inner.state.read().await;
        SystemHealth::summarize(
            state.entries.iter().map(|e| &e.snapshot),
            state.active_id.as_deref(),
        )
    }

    // =========================================================================
    // Failover
    // =========================================================================

    /// Keeps the active endpoint if it is still selectable; otherwise moves
    /// to the best one (possibly none).
    fn evaluate_failover(&self, state: &mut RegistryState) -> Option<FailoverEvent> {
        let reason = match state.active() {
            Some(active) if active.is_selectable() => return None,
            Some(active) if !active.config.enabled => FailoverReason::Disabled,
            Some(_) => FailoverReason::Unhealthy,
            None => FailoverReason::Recovered,
        };

        let best = state.best_id();
        if reason == FailoverReason::Recovered && best.is_none() {
            // Still nothing to activate; clear a dangling id if any.
            state.active_id = None;
            return None;
        }
        self.activate(state, best, reason)
    }

    /// Sets the active endpoint, broadcasts the change and publishes the new
    /// active config.
    fn activate(
        &self,
        state: &mut RegistryState,
        to: Option<String>,
        reason: FailoverReason,
    ) -> Option<FailoverEvent> {
        let from = state.active_id.clone();
        if from == to && reason != FailoverReason::Manual {
            return None;
        }
        state.active_id = to.clone();

        let event = FailoverEvent {
            from,
            to,
            reason,
            at: self.inner.clock.now(),
        };
        match &event.to {
            Some(to) => info!(
                from = ?event.from,
                to = %to,
                reason = %reason,
                "Active endpoint changed"
            ),
            None => warn!(
                from = ?event.from,
                reason = %reason,
                "No endpoint available, running degraded"
            ),
        }

        let _ = self.inner.failover_tx.send(event.clone());
        self.publish_active(state);
        Some(event)
    }

    fn publish_active(&self, state: &RegistryState) {
        let active = state.active().map(|s| s.config.clone());
        self.inner.active_tx.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }

    /// Makes `id` active regardless of health. Emits a `manual` failover.
    pub async fn switch_to(&self, id: &str) -> SyncResult<FailoverEvent> {
        let mut state = self.inner.state.write().await;
        let entry = state
            .entry(id)
            .ok_or_else(|| SyncError::UnknownEndpoint(id.to_string()))?;
        if !entry.snapshot.config.enabled {
            return Err(SyncError::InvalidConfig(format!(
                "endpoint '{}' is disabled",
                id
            )));
        }
        if !entry.snapshot.health.is_online() {
            warn!(endpoint_id = %id, "Switching to an endpoint that is not online");
        }

        self.activate(&mut state, Some(id.to_string()), FailoverReason::Manual)
            .ok_or_else(|| SyncError::Internal("manual switch produced no event".into()))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshots of every endpoint, in registration order.
    pub async fn endpoints(&self) -> Vec<EndpointSnapshot> {
        let state = self.inner.state.read().await;
        state.entries.iter().map(|e| e.snapshot.clone()).collect()
    }

    /// Health of one endpoint.
    pub async fn health(&self, id: &str) -> Option<EndpointHealth> {
        let state = self.inner.state.read().await;
        state.entry(id).map(|e| e.snapshot.health.clone())
    }

    /// The active endpoint.
    pub async fn active(&self) -> Option<EndpointSnapshot> {
        self.inner.state.read().await.active().cloned()
    }

    /// Id of the active endpoint.
    pub async fn active_id(&self) -> Option<String> {
        self.inner.state.read().await.active_id.clone()
    }

    /// Receives every change of the active endpoint.
    pub fn subscribe_failover(&self) -> broadcast::Receiver<FailoverEvent> {
        self.inner.failover_tx.subscribe()
    }

    /// Watches the active endpoint's config.
    pub fn watch_active(&self) -> watch::Receiver<Option<EndpointConfig>> {
        self.inner.active_tx.subscribe()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the periodic health cycle. The first cycle runs immediately.
    /// Starting a running registry does nothing.
    pub async fn start(&self) {
        let mut slot = self.inner.health_loop.lock().await;
        if slot.is_some() {
            debug!("Health loop already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let registry = self.clone();
        let interval = self.inner.config.health_interval;

        let task = tokio::spawn(async move {
            info!(?interval, "Health loop starting");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.run_health_cycle().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            info!("Health loop stopped");
        });

        *slot = Some(HealthLoop { shutdown_tx, task });
    }

    /// Stops the periodic health cycle and waits for it to finish.
    pub async fn stop(&self) {
        let health_loop = self.inner.health_loop.lock().await.take();
        if let Some(HealthLoop { shutdown_tx, task }) = health_loop {
            let _ = shutdown_tx.send(()).await;
            if let Err(e) = task.await {
                warn!(?e, "Health loop task failed");
            }
        }
    }

    /// Returns true while the periodic health cycle runs.
    pub async fn is_running(&self) -> bool {
        self.inner.health_loop.lock().await.is_some()
    }
}
