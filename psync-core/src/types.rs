/// Core data model for progress tracking and synchronization
///
/// A `ProgressRecord` is the unit of local state: one entry per item key,
/// holding the most recently applied value whether it arrived from a local
/// edit or from reconciliation against the remote store.

use serde::{Deserialize, Serialize};

/// Synchronization state of a progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Applied locally, not yet handed to the batcher
    Pending,
    /// Waiting in the pending batch for the window to close
    Batched,
    /// Included in a save currently on the wire
    InFlight,
    /// Acknowledged by the remote store
    Synced,
    /// Parked in the offline outbox awaiting replay
    QueuedOffline,
}

/// One entry per distinct item key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Unique identifier of the thing being tracked
    pub item_key: String,
    /// The recorded answer/selection
    pub value: String,
    /// Optional free-text justification
    pub note: Option<String>,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Epoch milliseconds, set at the moment of local edit
    pub local_timestamp: i64,
    /// Where this record sits in the sync pipeline
    pub sync_state: SyncState,
}

impl ProgressRecord {
    /// Create a record fresh from a local edit, in the `Pending` state.
    pub fn new(
        item_key: impl Into<String>,
        value: impl Into<String>,
        note: Option<String>,
        attempt: u32,
        local_timestamp: i64,
    ) -> Self {
        Self {
            item_key: item_key.into(),
            value: value.into(),
            note,
            attempt,
            local_timestamp,
            sync_state: SyncState::Pending,
        }
    }
}

/// The shape returned by the remote load endpoint.
///
/// Merge input only; never persisted verbatim. Converted to a
/// `ProgressRecord` when a merge applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    #[serde(rename = "itemKey")]
    pub item_key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub attempt: u32,
    pub timestamp: i64,
}

impl RemoteRecord {
    /// Convert into a local record. Remote records arrive already
    /// acknowledged, so they land in the `Synced` state.
    pub fn into_progress_record(self) -> ProgressRecord {
        ProgressRecord {
            item_key: self.item_key,
            value: self.value,
            note: self.note,
            attempt: self.attempt,
            local_timestamp: self.timestamp,
            sync_state: SyncState::Synced,
        }
    }
}

/// Result of merging a remote record into the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeResult {
    /// Whether the remote value replaced the local one
    pub applied: bool,
}

/// Kind of a queued outbox operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Save a progress record to the remote store
    Save,
}

/// A durable outbox entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Assigned by the outbox, monotonically increasing
    pub id: u64,
    /// Operation kind
    pub kind: OperationKind,
    /// Snapshot of the record at the time it was queued
    pub payload: ProgressRecord,
    /// Epoch milliseconds at enqueue time
    pub queued_at: i64,
}
