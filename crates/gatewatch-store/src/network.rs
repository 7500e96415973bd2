//! # Network Observer
//!
//! Online/offline signal consumed by the sync queue worker.
//!
//! [`NetworkSignal`] is the in-process implementation; the orchestrator
//! drives it from the connection phase, tests drive it by hand.

use std::sync::Arc;

use tokio::sync::watch;

/// Source of the online/offline signal.
pub trait NetworkObserver: Send + Sync {
    /// Returns a receiver that observes every change.
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// Returns the current state.
    fn is_online(&self) -> bool;
}

/// Settable [`NetworkObserver`].
#[derive(Debug, Clone)]
pub struct NetworkSignal {
    /// Shared sender; receivers see every `set_online` call that changes the state.
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkSignal {
    /// Creates a signal in the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        NetworkSignal { tx: Arc::new(tx) }
    }

    /// Sets the state. Subscribers are only woken when it changes.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl Default for NetworkSignal {
    fn default() -> Self {
        NetworkSignal::new(false)
    }
}

impl NetworkObserver for NetworkSignal {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}
