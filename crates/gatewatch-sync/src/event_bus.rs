//! # Event Bus
//!
//! Typed publish/subscribe for realtime events.
//!
//! ## Dispatch
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           EventBus::publish                             │
//! │                                                                         │
//! │  event ──► history ring (last 100)                                     │
//! │        ──► handlers registered for event.kind   (registration order)  │
//! │        ──► wildcard handlers                    (registration order)  │
//! │        ──► broadcast subscribers                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A panicking handler is logged and skipped; the remaining handlers still
//! run. Handlers may call [`EventBus::off`] from inside a dispatch.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use gatewatch_core::event::{RealtimeEvent, RealtimeEventType};

/// Default number of events kept for [`EventBus::recent`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Capacity of the broadcast channel behind [`EventBus::subscribe`].
const BROADCAST_CAPACITY: usize = 256;

/// Callback invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Registration token returned by [`EventBus::on`] and [`EventBus::on_any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Handlers {
    typed: HashMap<RealtimeEventType, Vec<(HandlerId, EventHandler)>>,
    wildcard: Vec<(HandlerId, EventHandler)>,
}

struct BusInner {
    handlers: RwLock<Handlers>,
    history: Mutex<VecDeque<RealtimeEvent>>,
    history_capacity: usize,
    broadcast_tx: broadcast::Sender<RealtimeEvent>,
    next_id: AtomicU64,
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("history_capacity", &self.inner.history_capacity)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    /// Creates a bus keeping the last 100 events.
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Creates a bus keeping the last `capacity` events.
    pub fn with_history_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        EventBus {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(Handlers::default()),
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                history_capacity: capacity,
                broadcast_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers `handler` for one event type.
    pub async fn on<F>(&self, kind: RealtimeEventType, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .handlers
            .write()
            .await
            .typed
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Registers `handler` for every event.
    pub async fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .handlers
            .write()
            .await
            .wildcard
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub async fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write().await;

        let before = handlers.wildcard.len();
        handlers.wildcard.retain(|(h, _)| *h != id);
        if handlers.wildcard.len() != before {
            return true;
        }

        for list in handlers.typed.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            if list.len() != before {
                return true;
            }
        }
        false
    }

    /// Number of registered handlers (typed and wildcard).
    pub async fn handler_count(&self) -> usize {
        let handlers = self.inner.handlers.read().await;
        handlers.wildcard.len() + handlers.typed.values().map(Vec::len).sum::<usize>()
    }

    /// Returns a receiver of every published event.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Records `event` and delivers it to typed handlers, then wildcard
    /// handlers, then broadcast subscribers.
    pub async fn publish(&self, event: RealtimeEvent) {
        {
            let mut history = self.inner.history.lock().await;
            if self.inner.history_capacity > 0 {
                while history.len() >= self.inner.history_capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // Snapshot the handler lists so handlers can (un)register freely.
        let targets: Vec<EventHandler> = {
            let handlers = self.inner.handlers.read().await;
            handlers
                .typed
                .get(&event.kind)
                .into_iter()
                .flatten()
                .chain(handlers.wildcard.iter())
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        debug!(
            event_type = %event.kind,
            handlers = targets.len(),
            "Publishing event"
        );

        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(event_type = %event.kind, "Event handler panicked");
            }
        }

        // No subscribers is fine.
        let _ = self.inner.broadcast_tx.send(event);
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Returns up to `limit` most recent events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<RealtimeEvent> {
        let history = self.inner.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Drops the recorded history.
    pub async fn clear_history(&self) {
        self.inner.history.lock().await.clear();
    }
}
