/// Transport definitions for the progress API
///
/// Defines the wire shapes for save and load calls and the transport seam
/// the sync executor talks through. The HTTP implementation lives in
/// `transport::http`; `MockTransport` here backs the test suite.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use psync_core::{Error, OperationKind, ProgressRecord, RemoteRecord, Result};

#[cfg(feature = "http")]
pub mod http;

/// Wire shape of one record in a save request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveData {
    #[serde(rename = "itemKey")]
    pub item_key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub attempt: u32,
    pub timestamp: i64,
}

impl From<&ProgressRecord> for SaveData {
    fn from(record: &ProgressRecord) -> Self {
        Self {
            item_key: record.item_key.clone(),
            value: record.value.clone(),
            note: record.note.clone(),
            attempt: record.attempt,
            timestamp: record.local_timestamp,
        }
    }
}

/// One operation in a batch save request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOperation {
    pub kind: OperationKind,
    pub data: SaveData,
}

impl SaveOperation {
    pub fn save(record: &ProgressRecord) -> Self {
        Self {
            kind: OperationKind::Save,
            data: SaveData::from(record),
        }
    }
}

/// Body of `POST /progress/batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSaveRequest {
    pub operations: Vec<SaveOperation>,
}

/// Result of a single operation within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(rename = "itemKey")]
    pub item_key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to `POST /progress/batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSaveResponse {
    pub results: Vec<OperationResult>,
}

/// Response to `GET /progress`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub records: Vec<RemoteRecord>,
}

/// Trait for progress transport implementations
#[async_trait]
pub trait ProgressTransport: Send + Sync {
    /// Save a single record (`POST /progress`); used when replaying
    /// finalized outbox payloads.
    async fn save(&self, data: &SaveData, token: &str) -> Result<()>;

    /// Save a batch of operations (`POST /progress/batch`).
    async fn save_batch(&self, request: &BatchSaveRequest, token: &str)
        -> Result<BatchSaveResponse>;

    /// Load remote records changed since the given epoch-millisecond
    /// watermark (`GET /progress?since=...`); `None` requests the full set.
    async fn load_since(&self, since_ms: Option<i64>, token: &str) -> Result<Vec<RemoteRecord>>;
}

/// Mock transport for testing
///
/// Records every request and can be scripted to fail a given number of
/// save or load calls before succeeding.
pub struct MockTransport {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    fail_saves: u32,
    fail_loads: u32,
    saved_batches: Vec<BatchSaveRequest>,
    saved_singles: Vec<SaveData>,
    remote_records: Vec<RemoteRecord>,
    save_calls: u32,
    load_calls: u32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Fail the next `n` save calls (single or batch) with a transport error
    pub fn fail_next_saves(&self, n: u32) {
        self.state.lock().fail_saves = n;
    }

    /// Fail the next `n` load calls with a transport error
    pub fn fail_next_loads(&self, n: u32) {
        self.state.lock().fail_loads = n;
    }

    /// Set the records returned by subsequent loads
    pub fn set_remote_records(&self, records: Vec<RemoteRecord>) {
        self.state.lock().remote_records = records;
    }

    /// Batch bodies received so far
    pub fn saved_batches(&self) -> Vec<BatchSaveRequest> {
        self.state.lock().saved_batches.clone()
    }

    /// Single-record saves received so far
    pub fn saved_singles(&self) -> Vec<SaveData> {
        self.state.lock().saved_singles.clone()
    }

    /// Total save calls attempted, including failed ones
    pub fn save_calls(&self) -> u32 {
        self.state.lock().save_calls
    }

    /// Total load calls attempted, including failed ones
    pub fn load_calls(&self) -> u32 {
        self.state.lock().load_calls
    }

    /// Total network calls of any kind
    pub fn total_calls(&self) -> u32 {
        let state = self.state.lock();
        state.save_calls + state.load_calls
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressTransport for MockTransport {
    async fn save(&self, data: &SaveData, _token: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.save_calls += 1;
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(Error::Transport("scripted save failure".to_string()));
        }
        state.saved_singles.push(data.clone());
        Ok(())
    }

    async fn save_batch(
        &self,
        request: &BatchSaveRequest,
        _token: &str,
    ) -> Result<BatchSaveResponse> {
        let mut state = self.state.lock();
        state.save_calls += 1;
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(Error::Transport("scripted save failure".to_string()));
        }
        state.saved_batches.push(request.clone());

        let results = request
            .operations
            .iter()
            .map(|op| OperationResult {
                item_key: op.data.item_key.clone(),
                success: true,
                error: None,
            })
            .collect();
        Ok(BatchSaveResponse { results })
    }

    async fn load_since(&self, since_ms: Option<i64>, _token: &str) -> Result<Vec<RemoteRecord>> {
        let mut state = self.state.lock();
        state.load_calls += 1;
        if state.fail_loads > 0 {
            state.fail_loads -= 1;
            return Err(Error::Transport("scripted load failure".to_string()));
        }

        let since = since_ms.unwrap_or(i64::MIN);
        Ok(state
            .remote_records
            .iter()
            .filter(|r| r.timestamp > since)
            .cloned()
            .collect())
    }
}
