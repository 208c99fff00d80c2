/// Local state store: the in-process representation of per-item progress
///
/// Holds exactly one record per item key. Mutated from two directions: the
/// optimistic write path applies local edits unconditionally, and the
/// reconciliation merge applies remote records under last-write-wins.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{MergeResult, ProgressRecord, RemoteRecord, SyncState};

/// In-process store of per-item progress records
pub struct LocalStateStore {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl LocalStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store seeded with existing records (e.g. reloaded from
    /// the persistence hook after a process restart).
    pub fn with_records(records: Vec<ProgressRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.item_key.clone(), r))
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }

    /// Apply a local edit, synchronously and unconditionally.
    ///
    /// This is the optimistic-update path: the caller has already decided
    /// this edit should win locally.
    pub fn apply(&self, record: ProgressRecord) {
        self.records
            .write()
            .insert(record.item_key.clone(), record);
    }

    /// Get the current record for an item key
    pub fn get(&self, item_key: &str) -> Option<ProgressRecord> {
        self.records.read().get(item_key).cloned()
    }

    /// Merge a remote record under last-write-wins.
    ///
    /// The remote value is applied only if its timestamp is strictly
    /// greater than the local one; equal timestamps keep the existing
    /// local value. This comparison is the entire conflict policy.
    pub fn merge_remote(&self, remote: RemoteRecord) -> MergeResult {
        let mut records = self.records.write();

        if let Some(local) = records.get(&remote.item_key) {
            if remote.timestamp <= local.local_timestamp {
                return MergeResult { applied: false };
            }
        }

        debug!(item_key = %remote.item_key, timestamp = remote.timestamp, "applying remote record");
        let record = remote.into_progress_record();
        records.insert(record.item_key.clone(), record);
        MergeResult { applied: true }
    }

    /// Update the sync state of an existing record. Unknown keys are a
    /// no-op: the record may have been superseded by a newer edit.
    pub fn set_sync_state(&self, item_key: &str, state: SyncState) {
        if let Some(record) = self.records.write().get_mut(item_key) {
            record.sync_state = state;
        }
    }

    /// Snapshot of every record, for the persistence hook
    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of tracked items
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Drop every record (the explicit "clear all data" action)
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for LocalStateStore {
    fn default() -> Self {
        Self::new()
    }
}
