/// Durable offline outbox: a bounded FIFO of not-yet-acknowledged operations
///
/// Backed by an append-only log replayed at open, so queued operations
/// survive a process restart. Format:
/// [magic(4) | version(4) | reserved(8)] [frame...]
/// Frame: [len(4) | bincode(LogEntry) | crc(4)]
///
/// Capacity is bounded: when full, the entry with the smallest `queued_at`
/// is evicted to admit a new one. The queue knows nothing about network
/// state or auth; replay order and removal are the caller's business.

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{OperationKind, ProgressRecord, QueuedOperation};

const LOG_MAGIC: u32 = 0x50534F42; // "PSOB"
const LOG_VERSION: u32 = 1;
const LOG_HEADER_SIZE: usize = 16;
const FRAME_LEN_SIZE: usize = 4;
const MAX_FRAME_SIZE: u32 = 1 << 20;

/// How many dead frames to tolerate before rewriting the log
const COMPACT_DEAD_FRAMES: usize = 64;

/// One record in the append log
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogEntry {
    Enqueue(QueuedOperation),
    Remove(u64),
    /// Next id to assign; written on rewrite so compacting away the
    /// highest-id entry cannot cause id reuse after a restart
    Watermark(u64),
}

/// Bounded durable FIFO of queued operations
pub struct OfflineOutbox {
    inner: Mutex<OutboxInner>,
    max_queue_size: usize,
}

struct OutboxInner {
    entries: Vec<QueuedOperation>,
    next_id: u64,
    log: Option<LogBackend>,
    /// Frames in the log that no longer correspond to a live entry
    dead_frames: usize,
}

struct LogBackend {
    file: File,
    path: PathBuf,
}

impl OfflineOutbox {
    /// Open (or create) a log-backed outbox at `path`.
    ///
    /// Existing frames are replayed to rebuild the live set. A torn or
    /// corrupt tail is truncated so a crash mid-append never prevents
    /// reopening.
    pub fn open(path: impl AsRef<Path>, max_queue_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_header(&mut file)?;
        }

        let (entries, next_id, dead_frames, valid_len) = replay(&mut file)?;

        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            warn!(
                path = %path.display(),
                truncated = actual_len - valid_len,
                "truncating torn outbox log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            inner: Mutex::new(OutboxInner {
                entries,
                next_id,
                log: Some(LogBackend { file, path }),
                dead_frames,
            }),
            max_queue_size,
        })
    }

    /// Create an outbox with no backing file. Same API, nothing survives
    /// a restart; used by tests and ephemeral engines.
    pub fn in_memory(max_queue_size: usize) -> Self {
        Self {
            inner: Mutex::new(OutboxInner {
                entries: Vec::new(),
                next_id: 1,
                log: None,
                dead_frames: 0,
            }),
            max_queue_size,
        }
    }

    /// Enqueue an operation, durably.
    ///
    /// Assigns and returns a monotonically increasing id. If the queue is
    /// at capacity the entry with the smallest `queued_at` is evicted
    /// first; sustained failure is bounded and lossy by design.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        payload: ProgressRecord,
        queued_at: i64,
    ) -> Result<u64> {
        if self.max_queue_size == 0 {
            return Err(Error::QueueFull("outbox capacity is zero".to_string()));
        }

        let mut inner = self.inner.lock();

        while inner.entries.len() >= self.max_queue_size {
            let oldest = inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, op)| (op.queued_at, op.id))
                .map(|(i, _)| i)
                .expect("non-empty queue has an oldest entry");

            let evicted = inner.entries.remove(oldest);
            warn!(
                id = evicted.id,
                item_key = %evicted.payload.item_key,
                "outbox full, evicting oldest operation"
            );
            inner.append(&LogEntry::Remove(evicted.id))?;
            inner.dead_frames += 2;
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let op = QueuedOperation {
            id,
            kind,
            payload,
            queued_at,
        };

        inner.append(&LogEntry::Enqueue(op.clone()))?;
        inner.entries.push(op);
        debug!(id, queue_len = inner.entries.len(), "queued operation");

        Ok(id)
    }

    /// All queued operations, ordered by `queued_at` ascending
    /// (id as tiebreak).
    pub fn get_all(&self) -> Vec<QueuedOperation> {
        let inner = self.inner.lock();
        let mut ops = inner.entries.clone();
        ops.sort_by_key(|op| (op.queued_at, op.id));
        ops
    }

    /// Remove an acknowledged operation. Removing an unknown id is a no-op.
    pub fn remove(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();

        let Some(position) = inner.entries.iter().position(|op| op.id == id) else {
            return Ok(());
        };

        inner.entries.remove(position);
        inner.append(&LogEntry::Remove(id))?;
        inner.dead_frames += 2;

        if inner.dead_frames >= COMPACT_DEAD_FRAMES && inner.dead_frames >= inner.entries.len() {
            inner.compact()?;
        }

        Ok(())
    }

    /// Drop every queued operation.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.dead_frames = 0;
        inner.rewrite_log()
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the outbox is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

impl OutboxInner {
    /// Append one frame and make it durable
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };

        let data = bincode::serialize(entry)
            .map_err(|e| Error::Internal(format!("serialize log entry: {}", e)))?;
        let crc = crc32fast::hash(&data);

        let mut buf = BytesMut::with_capacity(FRAME_LEN_SIZE + data.len() + 4);
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(&data);
        buf.put_u32_le(crc);

        log.file.seek(SeekFrom::End(0))?;
        log.file.write_all(&buf)?;
        log.file.sync_all()?;
        Ok(())
    }

    /// Rewrite the log from the live set, dropping dead frames
    fn compact(&mut self) -> Result<()> {
        debug!(
            live = self.entries.len(),
            dead = self.dead_frames,
            "compacting outbox log"
        );
        self.dead_frames = 0;
        self.rewrite_log()
    }

    fn rewrite_log(&mut self) -> Result<()> {
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };

        let tmp_path = log.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;

        let mut frames: Vec<LogEntry> = self
            .entries
            .iter()
            .map(|op| LogEntry::Enqueue(op.clone()))
            .collect();
        frames.push(LogEntry::Watermark(self.next_id));

        for entry in &frames {
            let data = bincode::serialize(entry)
                .map_err(|e| Error::Internal(format!("serialize log entry: {}", e)))?;
            let crc = crc32fast::hash(&data);

            let mut buf = BytesMut::with_capacity(FRAME_LEN_SIZE + data.len() + 4);
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(&data);
            buf.put_u32_le(crc);
            tmp.write_all(&buf)?;
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &log.path)?;
        log.file = tmp;
        Ok(())
    }
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = BytesMut::with_capacity(LOG_HEADER_SIZE);
    header.put_u32(LOG_MAGIC);
    header.put_u32_le(LOG_VERSION);
    header.put_u64_le(0); // reserved
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(())
}

/// Replay the log, returning the live set, the next id to assign, the
/// count of dead frames, and the byte offset of the last valid frame.
fn replay(file: &mut File) -> Result<(Vec<QueuedOperation>, u64, usize, u64)> {
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; LOG_HEADER_SIZE];
    file.read_exact(&mut header)?;
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != LOG_MAGIC {
        return Err(Error::Corruption("invalid outbox log magic".to_string()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != LOG_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported outbox log version {}",
            version
        )));
    }

    let mut entries: Vec<QueuedOperation> = Vec::new();
    let mut max_id = 0u64;
    let mut frames = 0usize;
    let mut valid_len = LOG_HEADER_SIZE as u64;

    loop {
        let mut len_buf = [0u8; FRAME_LEN_SIZE];
        match file.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_FRAME_SIZE {
            // A crash mid-append can leave arbitrary bytes here
            break;
        }

        let mut data = vec![0u8; len as usize];
        let mut crc_buf = [0u8; 4];
        let read_body = file
            .read_exact(&mut data)
            .and_then(|_| file.read_exact(&mut crc_buf));
        match read_body {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let crc = u32::from_le_bytes(crc_buf);
        if crc32fast::hash(&data) != crc {
            break;
        }

        let entry: LogEntry = match bincode::deserialize(&data) {
            Ok(entry) => entry,
            Err(_) => break,
        };

        frames += 1;
        valid_len += (FRAME_LEN_SIZE + data.len() + 4) as u64;

        match entry {
            LogEntry::Enqueue(op) => {
                max_id = max_id.max(op.id);
                entries.push(op);
            }
            LogEntry::Remove(id) => {
                entries.retain(|op| op.id != id);
            }
            LogEntry::Watermark(next_id) => {
                max_id = max_id.max(next_id.saturating_sub(1));
            }
        }
    }

    let dead_frames = frames.saturating_sub(entries.len());
    Ok((entries, max_id + 1, dead_frames, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(key: &str, timestamp: i64) -> ProgressRecord {
        ProgressRecord::new(key, "A", None, 1, timestamp)
    }

    #[test]
    fn test_enqueue_and_order() {
        let outbox = OfflineOutbox::in_memory(100);

        outbox.enqueue(OperationKind::Save, record("Q2", 0), 200).unwrap();
        outbox.enqueue(OperationKind::Save, record("Q1", 0), 100).unwrap();
        outbox.enqueue(OperationKind::Save, record("Q3", 0), 300).unwrap();

        let ops = outbox.get_all();
        assert_eq!(ops.len(), 3);
        let keys: Vec<_> = ops.iter().map(|op| op.payload.item_key.as_str()).collect();
        assert_eq!(keys, vec!["Q1", "Q2", "Q3"]);
    }

    #[test]
    fn test_ids_monotonically_increase() {
        let outbox = OfflineOutbox::in_memory(100);
        let a = outbox.enqueue(OperationKind::Save, record("Q1", 0), 1).unwrap();
        let b = outbox.enqueue(OperationKind::Save, record("Q2", 0), 2).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let outbox = OfflineOutbox::in_memory(100);

        for i in 0..100 {
            outbox
                .enqueue(OperationKind::Save, record(&format!("Q{}", i), 0), i)
                .unwrap();
        }
        assert_eq!(outbox.len(), 100);

        // 101st evicts the smallest queued_at
        outbox.enqueue(OperationKind::Save, record("Q100", 0), 100).unwrap();
        assert_eq!(outbox.len(), 100);

        let ops = outbox.get_all();
        assert!(ops.iter().all(|op| op.payload.item_key != "Q0"));
        assert!(ops.iter().any(|op| op.payload.item_key == "Q100"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let outbox = OfflineOutbox::in_memory(100);
        let id = outbox.enqueue(OperationKind::Save, record("Q1", 0), 1).unwrap();

        outbox.remove(id).unwrap();
        assert_eq!(outbox.len(), 0);

        // Removing again is a no-op
        outbox.remove(id).unwrap();
        outbox.remove(9999).unwrap();
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let outbox = OfflineOutbox::in_memory(0);
        let err = outbox
            .enqueue(OperationKind::Save, record("Q1", 0), 1)
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_FULL");
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.log");

        {
            let outbox = OfflineOutbox::open(&path, 100).unwrap();
            outbox.enqueue(OperationKind::Save, record("Q1", 0), 100).unwrap();
            let id = outbox.enqueue(OperationKind::Save, record("Q2", 0), 200).unwrap();
            outbox.enqueue(OperationKind::Save, record("Q3", 0), 300).unwrap();
            outbox.remove(id).unwrap();
        }

        let outbox = OfflineOutbox::open(&path, 100).unwrap();
        let ops = outbox.get_all();
        assert_eq!(ops.len(), 2);
        let keys: Vec<_> = ops.iter().map(|op| op.payload.item_key.as_str()).collect();
        assert_eq!(keys, vec!["Q1", "Q3"]);

        // Ids keep increasing across a restart
        let id = outbox.enqueue(OperationKind::Save, record("Q4", 0), 400).unwrap();
        assert!(id >= 4);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.log");

        {
            let outbox = OfflineOutbox::open(&path, 100).unwrap();
            outbox.enqueue(OperationKind::Save, record("Q1", 0), 100).unwrap();
        }

        // Simulate a crash mid-append: garbage where a frame should start
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFF, 0x13, 0x07]).unwrap();
        }

        let outbox = OfflineOutbox::open(&path, 100).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.get_all()[0].payload.item_key, "Q1");

        // The truncated log accepts appends again
        outbox.enqueue(OperationKind::Save, record("Q2", 0), 200).unwrap();
        drop(outbox);

        let reopened = OfflineOutbox::open(&path, 100).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_compaction_preserves_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.log");

        let outbox = OfflineOutbox::open(&path, 1000).unwrap();
        let mut keep = Vec::new();
        for i in 0..80 {
            let id = outbox
                .enqueue(OperationKind::Save, record(&format!("Q{}", i), 0), i)
                .unwrap();
            if i % 10 == 0 {
                keep.push(id);
            } else {
                outbox.remove(id).unwrap();
            }
        }
        assert_eq!(outbox.len(), keep.len());
        drop(outbox);

        let reopened = OfflineOutbox::open(&path, 1000).unwrap();
        let ids: Vec<_> = reopened.get_all().iter().map(|op| op.id).collect();
        assert_eq!(ids, keep);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.log");

        let outbox = OfflineOutbox::open(&path, 100).unwrap();
        outbox.enqueue(OperationKind::Save, record("Q1", 0), 100).unwrap();
        outbox.clear().unwrap();
        assert!(outbox.is_empty());
        drop(outbox);

        let reopened = OfflineOutbox::open(&path, 100).unwrap();
        assert!(reopened.is_empty());
    }
}
