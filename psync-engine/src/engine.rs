/// The progress synchronization engine
///
/// Ties the pieces together: optimistic writes into the local store, a
/// debounced pending batch, the retrying executor, the durable outbox,
/// and the periodic reconciler. One engine instance owns its store and
/// outbox exclusively; external collaborators only hear about state via
/// the lifecycle channel or the persistence hook.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use psync_core::{
    EngineConfig, LocalStateStore, OfflineOutbox, ProgressRecord, QueuedOperation, SyncState,
};

use crate::batcher::PendingBatch;
use crate::collab::{Clock, LocalPersistence};
use crate::events::{EventChannel, LifecycleEvent};
use crate::executor::SyncExecutor;
use crate::reconciler::Reconciler;

/// A local edit handed to [`ProgressSyncEngine::record`].
///
/// `local_timestamp` is stamped from the engine clock when absent.
#[derive(Debug, Clone)]
pub struct RecordedEdit {
    pub item_key: String,
    pub value: String,
    pub note: Option<String>,
    pub attempt: u32,
    pub local_timestamp: Option<i64>,
}

impl RecordedEdit {
    pub fn new(item_key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            item_key: item_key.into(),
            value: value.into(),
            note: None,
            attempt: 1,
            local_timestamp: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Pin the edit timestamp instead of reading the engine clock
    pub fn at(mut self, local_timestamp: i64) -> Self {
        self.local_timestamp = Some(local_timestamp);
        self
    }
}

/// Progress synchronization engine instance.
///
/// Cheap to clone handles are not provided; share the engine itself
/// behind an `Arc` if multiple owners need it. All methods that schedule
/// work must be called from within a tokio runtime.
pub struct ProgressSyncEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<LocalStateStore>,
    pub(crate) outbox: Arc<OfflineOutbox>,
    pub(crate) executor: Arc<SyncExecutor>,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) events: Arc<EventChannel>,
    pub(crate) persistence: Option<Arc<dyn LocalPersistence>>,
    pub(crate) clock: Arc<dyn Clock>,
    pending: Mutex<PendingBatch>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    flush_gate: tokio::sync::Mutex<()>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl EngineInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        store: Arc<LocalStateStore>,
        outbox: Arc<OfflineOutbox>,
        executor: Arc<SyncExecutor>,
        reconciler: Arc<Reconciler>,
        events: Arc<EventChannel>,
        persistence: Option<Arc<dyn LocalPersistence>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            outbox,
            executor,
            reconciler,
            events,
            persistence,
            clock,
            pending: Mutex::new(PendingBatch::new()),
            flush_timer: Mutex::new(None),
            flush_gate: tokio::sync::Mutex::new(()),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Drain the pending batch and hand it to the executor. Idempotent:
    /// an empty batch is a no-op, and the gate keeps two concurrent
    /// flushes from racing on the same batch.
    async fn flush(&self) {
        let _gate = self.flush_gate.lock().await;
        let batch = self.pending.lock().take();
        if batch.is_empty() {
            return;
        }
        self.executor.save_batch(batch).await;
    }

    fn persist_snapshot(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.persist(&self.store.snapshot()) {
                warn!(error = %e, "persisting local state failed");
            }
        }
    }
}

impl ProgressSyncEngine {
    pub(crate) fn from_inner(inner: EngineInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Record a local edit.
    ///
    /// The optimistic update is the only synchronous step: the record is
    /// applied to the local store and the persistence hook invoked before
    /// this returns. Everything network-shaped happens later, behind the
    /// batch window; the caller never sees a network error.
    pub fn record(&self, edit: RecordedEdit) {
        let local_timestamp = edit
            .local_timestamp
            .unwrap_or_else(|| self.inner.clock.now_ms());
        let record = ProgressRecord::new(
            edit.item_key,
            edit.value,
            edit.note,
            edit.attempt,
            local_timestamp,
        );

        self.inner.store.apply(record.clone());
        self.inner.persist_snapshot();

        let mut batched = record;
        batched.sync_state = SyncState::Batched;
        self.inner
            .store
            .set_sync_state(&batched.item_key, SyncState::Batched);

        let pending_len = {
            let mut pending = self.inner.pending.lock();
            pending.upsert(batched);
            pending.len()
        };

        if pending_len >= self.inner.config.batch_flush_threshold {
            // Backpressure relief valve: bursts don't wait out the window
            self.cancel_timer();
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.flush().await });
        } else {
            self.restart_timer();
        }
    }

    /// Force immediate processing of the pending batch.
    ///
    /// Best-effort at shutdown: the transport may not complete before the
    /// process exits.
    pub async fn flush(&self) {
        self.cancel_timer();
        self.inner.flush().await;
    }

    /// Run one reconciliation cycle now, outside the periodic cadence
    pub async fn reconcile_now(&self) {
        self.inner.reconciler.tick().await;
    }

    /// Replay the offline outbox now. Returns how many operations were
    /// acknowledged and removed.
    pub async fn drain_outbox(&self) -> psync_core::Result<usize> {
        self.inner.reconciler.drain_outbox().await
    }

    /// Start the background reconciliation loop
    pub fn start(&self) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut slot = self.inner.shutdown_tx.lock();
            if slot.is_some() {
                warn!("sync engine already started");
                return;
            }
            *slot = Some(shutdown_tx);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(inner.config.sync_interval_ms));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        inner.reconciler.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("sync engine shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the background loop after a best-effort flush of pending edits
    pub async fn stop(&self) {
        self.flush().await;

        let tx = self.inner.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    /// Current record for an item key
    pub fn get(&self, item_key: &str) -> Option<ProgressRecord> {
        self.inner.store.get(item_key)
    }

    /// Sync state of an item, if tracked
    pub fn sync_state(&self, item_key: &str) -> Option<SyncState> {
        self.inner.store.get(item_key).map(|r| r.sync_state)
    }

    /// Snapshot of all tracked records
    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        self.inner.store.snapshot()
    }

    /// Edits waiting in the current batch window
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Operations parked in the offline outbox
    pub fn outbox_len(&self) -> usize {
        self.inner.outbox.len()
    }

    /// Queued operations, oldest first
    pub fn queued_operations(&self) -> Vec<QueuedOperation> {
        self.inner.outbox.get_all()
    }

    /// Watermark of the last successful reconciliation
    pub fn last_successful_sync(&self) -> Option<i64> {
        self.inner.reconciler.last_successful_sync()
    }

    /// Take the lifecycle event receiver. Yields `Some` exactly once.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<LifecycleEvent>> {
        self.inner.events.subscribe()
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.flush_timer.lock().take() {
            handle.abort();
        }
    }

    /// (Re)start the debounce countdown; each new edit pushes the flush out
    fn restart_timer(&self) {
        let window = Duration::from_millis(self.inner.config.batch_window_ms);
        let inner = self.inner.clone();

        let mut timer = self.inner.flush_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            inner.flush().await;
        }));
    }
}
