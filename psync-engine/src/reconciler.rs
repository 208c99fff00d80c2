/// Periodic reconciliation against the remote store
///
/// Each tick drains the offline outbox when connectivity allows, then
/// pulls remote records changed since the last successful sync and merges
/// them into the local store under last-write-wins. Ticks never overlap;
/// a failed load simply skips the cycle and the next tick retries the
/// same window.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use psync_core::{LocalStateStore, OfflineOutbox, Result, SyncState};

use crate::collab::{Clock, LocalPersistence};
use crate::executor::SyncExecutor;

/// Pulls remote deltas on a fixed cadence and replays the outbox
pub struct Reconciler {
    store: Arc<LocalStateStore>,
    outbox: Arc<OfflineOutbox>,
    executor: Arc<SyncExecutor>,
    persistence: Option<Arc<dyn LocalPersistence>>,
    clock: Arc<dyn Clock>,
    last_successful_sync: RwLock<Option<i64>>,
    in_progress: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: Arc<LocalStateStore>,
        outbox: Arc<OfflineOutbox>,
        executor: Arc<SyncExecutor>,
        persistence: Option<Arc<dyn LocalPersistence>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            outbox,
            executor,
            persistence,
            clock,
            last_successful_sync: RwLock::new(None),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Watermark of the last successful reconciliation, epoch milliseconds
    pub fn last_successful_sync(&self) -> Option<i64> {
        *self.last_successful_sync.read()
    }

    /// Run one reconciliation cycle. A tick that arrives while another is
    /// still running is skipped, not queued.
    pub async fn tick(&self) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            debug!("reconciliation already in progress, skipping tick");
            return;
        }

        self.run().await;
        self.in_progress.store(false, Ordering::SeqCst);
    }

    async fn run(&self) {
        // Replay queued operations before pulling, so our own edits are
        // not shadowed by a stale remote snapshot
        if !self.outbox.is_empty() {
            match self.drain_outbox().await {
                Ok(drained) if drained > 0 => {
                    info!(drained, remaining = self.outbox.len(), "drained offline outbox")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "outbox drain stopped early"),
            }
        }

        let since = self.last_successful_sync();
        let records = match self.executor.load_since(since).await {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "load failed, skipping reconciliation cycle");
                return;
            }
        };

        let mut applied = 0usize;
        for remote in records {
            if self.store.merge_remote(remote).applied {
                applied += 1;
            }
        }

        if applied > 0 {
            debug!(applied, "merged remote records");
            self.persist_snapshot();
        }

        // The load succeeded, so this window is covered; advance even if
        // nothing applied
        *self.last_successful_sync.write() = Some(self.clock.now_ms());
    }

    /// Replay every queued operation in order, removing each only after a
    /// confirmed acknowledgment. A failure leaves the remainder queued
    /// for the next opportunity.
    pub async fn drain_outbox(&self) -> Result<usize> {
        let mut drained = 0usize;

        for op in self.outbox.get_all() {
            if let Err(e) = self.executor.save_queued(&op).await {
                warn!(id = op.id, error = %e, "replay failed, leaving remainder queued");
                return Err(e);
            }

            self.outbox.remove(op.id)?;
            drained += 1;

            // Mark the record synced unless a newer local edit superseded
            // the queued snapshot
            if let Some(current) = self.store.get(&op.payload.item_key) {
                if current.local_timestamp == op.payload.local_timestamp {
                    self.store
                        .set_sync_state(&op.payload.item_key, SyncState::Synced);
                }
            }
        }

        Ok(drained)
    }

    fn persist_snapshot(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.persist(&self.store.snapshot()) {
                warn!(error = %e, "persisting local state failed");
            }
        }
    }
}
