/// Pending batch accumulation with dedup-by-key semantics
///
/// Within one batch window only the most recent edit per item key
/// survives; older edits to the same key are superseded before they
/// reach the network.

use psync_core::ProgressRecord;

/// Edits accumulated during the current batch window.
///
/// Insertion-ordered; an upsert for an existing key replaces the entry in
/// place when the new edit is at least as recent.
pub struct PendingBatch {
    entries: Vec<ProgressRecord>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add or replace the edit for this record's key, keeping the most
    /// recent by `local_timestamp`. A later call with an equal timestamp
    /// wins: it is the more recent edit.
    pub fn upsert(&mut self, record: ProgressRecord) {
        match self
            .entries
            .iter_mut()
            .find(|r| r.item_key == record.item_key)
        {
            Some(existing) => {
                if record.local_timestamp >= existing.local_timestamp {
                    *existing = record;
                }
            }
            None => self.entries.push(record),
        }
    }

    /// Drain the batch in insertion order
    pub fn take(&mut self) -> Vec<ProgressRecord> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingBatch {
    fn default() -> Self {
        Self::new()
    }
}
