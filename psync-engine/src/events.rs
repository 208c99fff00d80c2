/// Lifecycle event channel for external UI consumption
///
/// Pure output boundary: the engine's correctness never depends on whether
/// anything is listening. With no subscriber, events fall on the floor.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Sync-state transitions published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// A save is about to go on the wire
    SyncStart { count: usize },
    /// A save was acknowledged by the remote store
    SyncSuccess { count: usize },
    /// A save exhausted its retries
    SyncError { error: String, count: usize },
    /// A batch began processing
    BatchStart { total: usize },
    /// Every record in a batch reached the remote store
    BatchComplete { total: usize },
    /// A record was parked in the offline outbox
    OfflineQueued { item_key: String },
}

/// Unbounded channel carrying lifecycle events
pub struct EventChannel {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Emit an event. Never fails; a closed or absent receiver is ignored.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    /// Take the receiver. Yields `Some` exactly once.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<LifecycleEvent>> {
        self.rx.lock().take()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
