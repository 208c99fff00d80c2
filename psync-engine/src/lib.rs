/// Progress synchronization engine
///
/// Records per-item progress edits locally and propagates them to an
/// authoritative remote store under unreliable connectivity: optimistic
/// local writes, a debounced save batcher, a retrying transport, a
/// durable offline outbox, and periodic last-write-wins reconciliation.

pub mod batcher;
pub mod collab;
pub mod engine;
pub mod events;
pub mod executor;
pub mod reconciler;
pub mod transport;

pub use batcher::PendingBatch;
pub use collab::{
    AlwaysOnline, Clock, ConnectivityProbe, LocalPersistence, ManualClock, StaticTokenProvider,
    SwitchableProbe, SystemClock, TokenProvider,
};
pub use engine::{ProgressSyncEngine, RecordedEdit};
pub use events::{EventChannel, LifecycleEvent};
pub use executor::SyncExecutor;
pub use reconciler::Reconciler;
pub use transport::{
    BatchSaveRequest, BatchSaveResponse, LoadResponse, MockTransport, OperationResult,
    ProgressTransport, SaveData, SaveOperation,
};

#[cfg(feature = "http")]
pub use transport::http::HttpTransport;

pub use psync_core::{
    EngineConfig, Error, LocalStateStore, MergeResult, OfflineOutbox, OperationKind,
    ProgressRecord, QueuedOperation, RemoteRecord, Result, RetryPolicy, SyncState,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::EngineInner;

/// Builder for a [`ProgressSyncEngine`]
///
/// Only the transport is required; every other collaborator has a
/// sensible default (no token, always online, wall-clock time, no
/// persistence hook, in-memory outbox).
pub struct ProgressSyncBuilder {
    transport: Option<Arc<dyn ProgressTransport>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    connectivity: Option<Arc<dyn ConnectivityProbe>>,
    persistence: Option<Arc<dyn LocalPersistence>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
    outbox_path: Option<PathBuf>,
    initial_records: Vec<ProgressRecord>,
}

impl ProgressSyncBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            tokens: None,
            connectivity: None,
            persistence: None,
            clock: None,
            config: EngineConfig::default(),
            outbox_path: None,
            initial_records: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ProgressTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_connectivity_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = Some(probe);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn LocalPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the outbox with an append log at this path so queued
    /// operations survive a restart. Without it the outbox is in-memory.
    pub fn with_outbox_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.outbox_path = Some(path.into());
        self
    }

    /// Seed the local store, e.g. from the persistence hook's last snapshot
    pub fn with_initial_records(mut self, records: Vec<ProgressRecord>) -> Self {
        self.initial_records = records;
        self
    }

    pub fn build(self) -> Result<ProgressSyncEngine> {
        let transport = self
            .transport
            .ok_or_else(|| Error::InvalidArgument("transport is required".to_string()))?;

        self.config.validate().map_err(Error::InvalidArgument)?;

        let outbox = Arc::new(match &self.outbox_path {
            Some(path) => OfflineOutbox::open(path, self.config.max_queue_size)?,
            None => OfflineOutbox::in_memory(self.config.max_queue_size),
        });

        let store = Arc::new(LocalStateStore::with_records(self.initial_records));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let tokens = self
            .tokens
            .unwrap_or_else(|| Arc::new(StaticTokenProvider::new(None)));
        let connectivity = self.connectivity.unwrap_or_else(|| Arc::new(AlwaysOnline));
        let events = Arc::new(EventChannel::new());

        let retry_policy = RetryPolicy::new(
            self.config.max_attempts,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
        );

        let executor = Arc::new(SyncExecutor::new(
            store.clone(),
            outbox.clone(),
            transport,
            tokens,
            connectivity,
            clock.clone(),
            events.clone(),
            retry_policy,
            Duration::from_millis(self.config.request_timeout_ms),
        ));

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            outbox.clone(),
            executor.clone(),
            self.persistence.clone(),
            clock.clone(),
        ));

        Ok(ProgressSyncEngine::from_inner(EngineInner::new(
            self.config,
            store,
            outbox,
            executor,
            reconciler,
            events,
            self.persistence,
            clock,
        )))
    }
}

impl Default for ProgressSyncBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_transport() {
        let result = ProgressSyncBuilder::new().build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = ProgressSyncBuilder::new()
            .with_transport(Arc::new(MockTransport::new()))
            .with_config(EngineConfig::new().with_max_attempts(0))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_build_with_defaults() {
        let engine = ProgressSyncBuilder::new()
            .with_transport(Arc::new(MockTransport::new()))
            .build()
            .unwrap();

        assert_eq!(engine.outbox_len(), 0);
        assert!(engine.subscribe().is_some());
    }

    #[tokio::test]
    async fn test_initial_records_seed_store() {
        let engine = ProgressSyncBuilder::new()
            .with_transport(Arc::new(MockTransport::new()))
            .with_initial_records(vec![ProgressRecord::new("Q1", "A", None, 1, 100)])
            .build()
            .unwrap();

        assert_eq!(engine.get("Q1").unwrap().value, "A");
    }
}
