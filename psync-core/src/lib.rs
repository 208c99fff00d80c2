/// Foundation types for the progress synchronization engine
///
/// Provides the local state store, the durable offline outbox, the retry
/// policy, and the shared data model used by the orchestration layer in
/// `psync-engine`.

pub mod config;
pub mod error;
pub mod outbox;
pub mod retry;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use outbox::OfflineOutbox;
pub use retry::{retries_attempted, retry_with_policy, RetryPolicy};
pub use store::LocalStateStore;
pub use types::{
    MergeResult, OperationKind, ProgressRecord, QueuedOperation, RemoteRecord, SyncState,
};
