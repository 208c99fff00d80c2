/// Sync executor: performs save and load operations against the remote
/// store, falling back to the offline outbox on precondition failure or
/// exhausted retries
///
/// The caller of the optimistic write path is never exposed to a network
/// error: everything here degrades to "queued locally, will sync later".

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use psync_core::{
    retry_with_policy, Error, LocalStateStore, OfflineOutbox, OperationKind, ProgressRecord,
    QueuedOperation, RemoteRecord, Result, RetryPolicy, SyncState,
};

use crate::collab::{Clock, ConnectivityProbe, TokenProvider};
use crate::events::{EventChannel, LifecycleEvent};
use crate::transport::{BatchSaveRequest, ProgressTransport, SaveData, SaveOperation};

/// Executes saves and loads, consulting the connectivity probe and token
/// provider before touching the network.
pub struct SyncExecutor {
    store: Arc<LocalStateStore>,
    outbox: Arc<OfflineOutbox>,
    transport: Arc<dyn ProgressTransport>,
    tokens: Arc<dyn TokenProvider>,
    connectivity: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    events: Arc<EventChannel>,
    retry_policy: RetryPolicy,
    request_timeout: Duration,
}

impl SyncExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LocalStateStore>,
        outbox: Arc<OfflineOutbox>,
        transport: Arc<dyn ProgressTransport>,
        tokens: Arc<dyn TokenProvider>,
        connectivity: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        events: Arc<EventChannel>,
        retry_policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            outbox,
            transport,
            tokens,
            connectivity,
            clock,
            events,
            retry_policy,
            request_timeout,
        }
    }

    /// Save a batch of records.
    ///
    /// Offline or missing auth short-circuits the whole batch into the
    /// outbox without network I/O. Otherwise the batch save is wrapped by
    /// the retry controller; exhausted retries also land in the outbox.
    /// The operation is never dropped.
    pub async fn save_batch(&self, batch: Vec<ProgressRecord>) {
        if batch.is_empty() {
            return;
        }
        let total = batch.len();
        self.events.emit(LifecycleEvent::BatchStart { total });

        if !self.connectivity.is_online() {
            debug!(count = total, "offline, queueing batch");
            self.queue_batch(batch);
            return;
        }

        let Some(token) = self.tokens.token() else {
            debug!(count = total, "no auth token, queueing batch");
            self.queue_batch(batch);
            return;
        };

        self.events.emit(LifecycleEvent::SyncStart { count: total });
        for record in &batch {
            self.store
                .set_sync_state(&record.item_key, SyncState::InFlight);
        }

        let request = BatchSaveRequest {
            operations: batch.iter().map(SaveOperation::save).collect(),
        };

        let result = retry_with_policy(&self.retry_policy, || {
            self.attempt_batch(&request, &token)
        })
        .await;

        match result {
            Ok(_) => {
                for record in &batch {
                    self.mark_state(&record.item_key, record.local_timestamp, SyncState::Synced);
                }
                self.events.emit(LifecycleEvent::SyncSuccess { count: total });
                self.events.emit(LifecycleEvent::BatchComplete { total });
            }
            Err(e) => {
                warn!(error = %e, count = total, "batch save exhausted retries, queueing");
                self.queue_batch(batch);
                self.events.emit(LifecycleEvent::SyncError {
                    error: e.to_string(),
                    count: total,
                });
            }
        }
    }

    /// Load remote records changed since the watermark. Single attempt;
    /// the reconciler repeats on its own schedule, so there is no retry.
    pub async fn load_since(&self, since_ms: Option<i64>) -> Result<Vec<RemoteRecord>> {
        if !self.connectivity.is_online() {
            return Err(Error::Offline);
        }
        let token = self.tokens.token().ok_or(Error::AuthMissing)?;

        match tokio::time::timeout(
            self.request_timeout,
            self.transport.load_since(since_ms, &token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        }
    }

    /// Replay a finalized outbox payload via the single-record endpoint.
    /// Single attempt; a failure leaves the entry queued for the next
    /// drain opportunity.
    pub async fn save_queued(&self, op: &QueuedOperation) -> Result<()> {
        if !self.connectivity.is_online() {
            return Err(Error::Offline);
        }
        let token = self.tokens.token().ok_or(Error::AuthMissing)?;

        let data = SaveData::from(&op.payload);
        match tokio::time::timeout(self.request_timeout, self.transport.save(&data, &token)).await
        {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn attempt_batch(
        &self,
        request: &BatchSaveRequest,
        token: &str,
    ) -> Result<crate::transport::BatchSaveResponse> {
        match tokio::time::timeout(self.request_timeout, self.transport.save_batch(request, token))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        }
    }

    fn timeout_error(&self) -> Error {
        Error::Transport(format!(
            "request timed out after {}ms",
            self.request_timeout.as_millis()
        ))
    }

    /// Park every record of a batch in the offline outbox.
    ///
    /// Eviction of the oldest entry under sustained failure is resolved
    /// here silently; an enqueue that cannot be made durable is logged
    /// and the record stays local-only.
    fn queue_batch(&self, batch: Vec<ProgressRecord>) {
        let queued_at = self.clock.now_ms();
        for record in batch {
            let item_key = record.item_key.clone();
            let local_timestamp = record.local_timestamp;
            match self.outbox.enqueue(OperationKind::Save, record, queued_at) {
                Ok(_) => {
                    self.mark_state(&item_key, local_timestamp, SyncState::QueuedOffline);
                    self.events
                        .emit(LifecycleEvent::OfflineQueued { item_key });
                }
                Err(e) => {
                    warn!(error = %e, item_key = %item_key, "failed to queue operation");
                }
            }
        }
    }

    /// Transition a record's state unless a newer local edit has
    /// superseded the snapshot this save carried.
    fn mark_state(&self, item_key: &str, local_timestamp: i64, state: SyncState) {
        if let Some(current) = self.store.get(item_key) {
            if current.local_timestamp == local_timestamp {
                self.store.set_sync_state(item_key, state);
            }
        }
    }
}
