//! # Sync Queue
//!
//! FIFO of writes that could not reach the gateway, replayed once the
//! network comes back.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Queue Drain                                │
//! │                                                                         │
//! │  queue: [w1, w2, w3]          pass size = 3 (snapshot at start)         │
//! │                                                                         │
//! │  w1 ──► replay ── ok ──► removed            queue: [w2, w3]             │
//! │  w2 ──► replay ── err ─► attempts += 1,     queue: [w3, w2']            │
//! │                          moved to the tail                              │
//! │  w3 ──► replay ── ok ──► removed            queue: [w2']                │
//! │                                                                         │
//! │  pass ends after 3 items; w2' waits for the next trigger                │
//! │                                                                         │
//! │  Every step is persisted under <namespace>sync-queue before the next   │
//! │  replay starts. Writes are never dropped.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggers (SyncQueueWorker)
//! - Network signal turns online
//! - Retry interval elapses while online
//! - Explicit `flush()`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use gatewatch_core::cache::QueuedWrite;
use gatewatch_core::clock::{Clock, SystemClock};

use crate::error::{StoreError, StoreResult};
use crate::network::NetworkObserver;
use crate::persistent::PersistentStore;

/// Suffix of the persisted queue key.
pub const QUEUE_KEY_SUFFIX: &str = "sync-queue";

// =============================================================================
// Replayer Seam
// =============================================================================

/// Delivers one queued write to the backend.
#[async_trait]
pub trait WriteReplayer: Send + Sync {
    /// Replays `write`. Any error leaves the write queued.
    async fn replay(&self, write: &QueuedWrite) -> StoreResult<()>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Writes attempted in this pass.
    pub attempted: usize,
    /// Writes delivered and removed.
    pub replayed: usize,
    /// Writes that failed and moved to the tail.
    pub failed: usize,
    /// Writes still queued after the pass.
    pub remaining: usize,
}

// =============================================================================
// Sync Queue
// =============================================================================

struct QueueInner {
    items: Mutex<VecDeque<QueuedWrite>>,
    store: Arc<dyn PersistentStore>,
    storage_key: String,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a pass so passes never interleave.
    draining: Mutex<()>,
}

/// Persistent FIFO of offline writes.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("storage_key", &self.inner.storage_key)
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    /// Opens the queue stored under `<namespace>sync-queue`, loading any
    /// writes left from a previous run. A corrupt payload is discarded.
    pub async fn open(store: Arc<dyn PersistentStore>, namespace: &str) -> Self {
        SyncQueue::open_with_clock(store, namespace, Arc::new(SystemClock)).await
    }

    /// Like [`open`](Self::open) with an explicit clock.
    pub async fn open_with_clock(
        store: Arc<dyn PersistentStore>,
        namespace: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage_key = format!("{namespace}{QUEUE_KEY_SUFFIX}");

        let items = match store.get(&storage_key).await {
            Ok(Some(text)) => match serde_json::from_str::<VecDeque<QueuedWrite>>(&text) {
                Ok(items) => items,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Discarding corrupt sync queue");
                    if let Err(e) = store.remove(&storage_key).await {
                        warn!(key = %storage_key, error = %e, "Failed to remove corrupt sync queue");
                    }
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to load sync queue");
                VecDeque::new()
            }
        };

        if !items.is_empty() {
            info!(pending = items.len(), "Restored queued writes");
        }

        SyncQueue {
            inner: Arc::new(QueueInner {
                items: Mutex::new(items),
                store,
                storage_key,
                clock,
                draining: Mutex::new(()),
            }),
        }
    }

    /// Appends a write to the tail.
    pub async fn enqueue(&self, key: impl Into<String>, payload: serde_json::Value) -> QueuedWrite {
        let write = QueuedWrite::new(key, payload, self.inner.clock.now());

        let mut items = self.inner.items.lock().await;
        items.push_back(write.clone());
        self.persist(&items).await;

        debug!(id = %write.id, key = %write.key, pending = items.len(), "Queued write");
        write
    }

    /// Number of queued writes.
    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    /// Returns true if nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.inner.items.lock().await.is_empty()
    }

    /// Snapshot of the queue, head first.
    pub async fn pending(&self) -> Vec<QueuedWrite> {
        self.inner.items.lock().await.iter().cloned().collect()
    }

    /// Replays the writes present when the pass starts, in order.
    ///
    /// Successes are removed; failures get `attempts + 1` and move to the
    /// tail. A concurrent call waits for the running pass, then runs its own.
    pub async fn drain(&self, replayer: &dyn WriteReplayer) -> DrainReport {
        let _pass = self.inner.draining.lock().await;
        let mut report = DrainReport::default();

        let pass_size = self.inner.items.lock().await.len();
        if pass_size == 0 {
            return report;
        }
        info!(pending = pass_size, "Draining sync queue");

        for _ in 0..pass_size {
            // Only drain removes from the head, so the head is stable while
            // the replay is in flight.
            let Some(write) = self.inner.items.lock().await.front().cloned() else {
                break;
            };
            report.attempted += 1;

            let outcome = replayer.replay(&write).await;

            let mut items = self.inner.items.lock().await;
            let Some(mut head) = pop_if_head(&mut items, &write.id) else {
                continue;
            };

            match outcome {
                Ok(()) => {
                    report.replayed += 1;
                    debug!(id = %head.id, key = %head.key, "Replayed queued write");
                }
                Err(e) => {
                    report.failed += 1;
                    head.record_failure(e.to_string());
                    warn!(
                        id = %head.id,
                        key = %head.key,
                        attempts = head.attempts,
                        error = %e,
                        "Replay failed, write moved to tail"
                    );
                    items.push_back(head);
                }
            }
            self.persist(&items).await;
        }

        report.remaining = self.inner.items.lock().await.len();
        info!(
            replayed = report.replayed,
            failed = report.failed,
            remaining = report.remaining,
            "Sync queue pass complete"
        );
        report
    }

    async fn persist(&self, items: &VecDeque<QueuedWrite>) {
        let result = match serde_json::to_string(items) {
            Ok(text) => self.inner.store.set(&self.inner.storage_key, &text).await,
            Err(e) => Err(StoreError::from(e)),
        };
        if let Err(e) = result {
            warn!(key = %self.inner.storage_key, error = %e, "Failed to persist sync queue");
        }
    }
}

fn pop_if_head(items: &mut VecDeque<QueuedWrite>, id: &str) -> Option<QueuedWrite> {
    if items.front().is_some_and(|w| w.id == id) {
        items.pop_front()
    } else {
        None
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Background task that drains the queue when the network allows.
pub struct SyncQueueWorker {
    /// Queue to drain.
    queue: SyncQueue,

    /// Delivers writes.
    replayer: Arc<dyn WriteReplayer>,

    /// Online/offline signal.
    network: watch::Receiver<bool>,

    /// Retry period while online with writes pending.
    retry_interval: Duration,

    /// Explicit drain requests.
    flush_rx: mpsc::Receiver<oneshot::Sender<DrainReport>>,

    /// Shutdown receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling the sync queue worker.
#[derive(Clone)]
pub struct SyncQueueHandle {
    /// Flush request sender.
    flush_tx: mpsc::Sender<oneshot::Sender<DrainReport>>,

    /// Shutdown sender.
    shutdown_tx: mpsc::Sender<()>,
}

impl SyncQueueHandle {
    /// Runs a drain pass now, whatever the network state, and returns its report.
    pub async fn flush(&self) -> StoreResult<DrainReport> {
        let (tx, rx) = oneshot::channel();
        self.flush_tx
            .send(tx)
            .await
            .map_err(|_| StoreError::Internal("Sync queue worker stopped".into()))?;
        rx.await
            .map_err(|_| StoreError::Internal("Sync queue worker dropped flush".into()))
    }

    /// Triggers graceful shutdown. Stopping an already stopped worker is fine.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl SyncQueueWorker {
    /// Creates a worker and returns its handle. Spawn [`run`](Self::run).
    pub fn new(
        queue: SyncQueue,
        replayer: Arc<dyn WriteReplayer>,
        network: &dyn NetworkObserver,
        retry_interval: Duration,
    ) -> (Self, SyncQueueHandle) {
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = SyncQueueWorker {
            queue,
            replayer,
            network: network.subscribe(),
            retry_interval,
            flush_rx,
            shutdown_rx,
        };

        (worker, SyncQueueHandle { flush_tx, shutdown_tx })
    }

    /// Creates a worker and spawns it on the current runtime.
    pub fn spawn(
        queue: SyncQueue,
        replayer: Arc<dyn WriteReplayer>,
        network: &dyn NetworkObserver,
        retry_interval: Duration,
    ) -> SyncQueueHandle {
        let (worker, handle) = SyncQueueWorker::new(queue, replayer, network, retry_interval);
        tokio::spawn(worker.run());
        handle
    }

    /// Runs the worker loop.
    pub async fn run(mut self) {
        info!("Sync queue worker starting");

        let mut interval = tokio::time::interval(self.retry_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut signal_open = true;

        // A write queued while we were offline in a previous run goes out as
        // soon as the first online signal arrives.
        let mut online = *self.network.borrow_and_update();
        if online {
            self.drain().await;
        }

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Sync queue worker shutting down");
                    break;
                }

                Some(reply) = self.flush_rx.recv() => {
                    let report = self.drain().await;
                    let _ = reply.send(report);
                }

                changed = self.network.changed(), if signal_open => {
                    if changed.is_err() {
                        debug!("Network signal closed");
                        signal_open = false;
                        continue;
                    }
                    let now_online = *self.network.borrow_and_update();
                    if now_online && !online {
                        info!("Network online, draining sync queue");
                        self.drain().await;
                    }
                    online = now_online;
                }

                _ = interval.tick() => {
                    if online {
                        self.drain().await;
                    }
                }
            }
        }

        info!("Sync queue worker stopped");
    }

    async fn drain(&self) -> DrainReport {
        if self.queue.is_empty().await {
            return DrainReport::default();
        }
        self.queue.drain(self.replayer.as_ref()).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
