/// Integration tests for the progress synchronization engine
///
/// Exercises the observable properties end to end against the mock
/// transport: batch dedup, burst flush, offline short-circuit, bounded
/// retry with outbox fallback, drain-on-reconnect, reconciliation, and
/// outbox durability across a restart.

use anyhow::Result;
use parking_lot::Mutex;
use psync_engine::{
    Clock, EngineConfig, LifecycleEvent, LocalPersistence, ManualClock, MockTransport,
    ProgressRecord, ProgressSyncBuilder, ProgressSyncEngine, RecordedEdit, RemoteRecord,
    StaticTokenProvider, SwitchableProbe, SyncState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct CapturingPersistence {
    calls: AtomicUsize,
    last_snapshot: Mutex<Vec<ProgressRecord>>,
}

impl CapturingPersistence {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            last_snapshot: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LocalPersistence for CapturingPersistence {
    fn persist(&self, records: &[ProgressRecord]) -> psync_engine::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_snapshot.lock() = records.to_vec();
        Ok(())
    }
}

struct TestRig {
    engine: ProgressSyncEngine,
    transport: Arc<MockTransport>,
    probe: Arc<SwitchableProbe>,
    tokens: Arc<StaticTokenProvider>,
    clock: Arc<ManualClock>,
}

fn rig(config: EngineConfig) -> TestRig {
    let transport = Arc::new(MockTransport::new());
    let probe = Arc::new(SwitchableProbe::new(true));
    let tokens = Arc::new(StaticTokenProvider::new(Some("bearer-token".into())));
    let clock = Arc::new(ManualClock::new(50_000));

    let engine = ProgressSyncBuilder::new()
        .with_transport(transport.clone())
        .with_connectivity_probe(probe.clone())
        .with_token_provider(tokens.clone())
        .with_clock(clock.clone())
        .with_config(config)
        .build()
        .unwrap();

    TestRig {
        engine,
        transport,
        probe,
        tokens,
        clock,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_batch_window_ms(2000)
        .with_batch_flush_threshold(10)
        .with_max_attempts(3)
        .with_base_delay_ms(10)
}

#[tokio::test(start_paused = true)]
async fn test_two_edits_same_key_transmit_one_operation() -> Result<()> {
    let rig = rig(fast_config());

    rig.engine.record(
        RecordedEdit::new("U1-L1-Q01", "B")
            .with_note("first")
            .with_attempt(1)
            .at(1000),
    );
    rig.engine.record(
        RecordedEdit::new("U1-L1-Q01", "C")
            .with_note("changed")
            .with_attempt(2)
            .at(1500),
    );

    rig.engine.flush().await;

    let batches = rig.transport.saved_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].operations.len(), 1);

    let body = serde_json::to_value(&batches[0])?;
    let op = &body["operations"][0];
    assert_eq!(op["kind"], "save");
    assert_eq!(op["data"]["itemKey"], "U1-L1-Q01");
    assert_eq!(op["data"]["value"], "C");
    assert_eq!(op["data"]["note"], "changed");
    assert_eq!(op["data"]["attempt"], 2);
    assert_eq!(op["data"]["timestamp"], 1500);

    assert_eq!(rig.engine.sync_state("U1-L1-Q01"), Some(SyncState::Synced));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_ten_flushes_immediately() {
    let rig = rig(fast_config().with_batch_window_ms(60_000));

    for i in 0..10 {
        rig.engine
            .record(RecordedEdit::new(format!("Q{}", i), "A").at(1000 + i));
    }

    // Let the spawned flush run; far less than the batch window elapses
    tokio::time::sleep(Duration::from_millis(20)).await;

    let batches = rig.transport.saved_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].operations.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_below_threshold_waits_for_window() {
    let rig = rig(fast_config());

    for i in 0..9 {
        rig.engine
            .record(RecordedEdit::new(format!("Q{}", i), "A").at(1000 + i));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rig.transport.saved_batches().is_empty());
    assert_eq!(rig.engine.pending_len(), 9);

    // The window elapses and the timer flushes
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let batches = rig.transport.saved_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].operations.len(), 9);
    assert_eq!(rig.engine.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_each_edit_restarts_the_window() {
    let rig = rig(fast_config());

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    rig.engine.record(RecordedEdit::new("Q2", "B").at(2500));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // 3s since the first edit, but each edit reset the countdown
    assert!(rig.transport.saved_batches().is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(rig.transport.saved_batches().len(), 1);
    assert_eq!(rig.transport.saved_batches()[0].operations.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_offline_short_circuit_queues_everything() {
    let rig = rig(fast_config());
    rig.probe.set_online(false);

    for i in 0..3 {
        rig.engine
            .record(RecordedEdit::new(format!("Q{}", i), "A").at(1000 + i));
    }
    rig.engine.flush().await;

    assert_eq!(rig.engine.outbox_len(), 3);
    assert_eq!(rig.transport.total_calls(), 0);
    assert_eq!(rig.engine.sync_state("Q0"), Some(SyncState::QueuedOffline));
}

#[tokio::test(start_paused = true)]
async fn test_missing_token_queues_like_offline() {
    let rig = rig(fast_config());
    rig.tokens.set_token(None);

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.flush().await;

    assert_eq!(rig.engine.outbox_len(), 1);
    assert_eq!(rig.transport.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fails_twice_succeeds_third() {
    let rig = rig(fast_config());
    rig.transport.fail_next_saves(2);

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.flush().await;

    assert_eq!(rig.transport.save_calls(), 3);
    assert_eq!(rig.engine.sync_state("Q1"), Some(SyncState::Synced));
    assert_eq!(rig.engine.outbox_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fall_back_to_outbox() {
    let rig = rig(fast_config());
    rig.transport.fail_next_saves(3);

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.flush().await;

    assert_eq!(rig.transport.save_calls(), 3);
    assert_eq!(rig.engine.outbox_len(), 1);
    assert_eq!(rig.engine.sync_state("Q1"), Some(SyncState::QueuedOffline));
}

#[tokio::test(start_paused = true)]
async fn test_bounded_outbox_evicts_oldest() {
    let rig = rig(fast_config().with_max_queue_size(3));
    rig.probe.set_online(false);

    for i in 0..5 {
        rig.engine
            .record(RecordedEdit::new(format!("Q{}", i), "A").at(1000 + i));
        rig.engine.flush().await;
        rig.clock.advance(10);
    }

    assert_eq!(rig.engine.outbox_len(), 3);
    let keys: Vec<_> = rig
        .engine
        .queued_operations()
        .into_iter()
        .map(|op| op.payload.item_key)
        .collect();
    assert_eq!(keys, vec!["Q2", "Q3", "Q4"]);
}

#[tokio::test(start_paused = true)]
async fn test_drain_after_reconnect() {
    let rig = rig(fast_config());
    rig.probe.set_online(false);

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.record(RecordedEdit::new("Q2", "B").at(1001));
    rig.engine.flush().await;
    assert_eq!(rig.engine.outbox_len(), 2);

    rig.probe.set_online(true);
    let drained = rig.engine.drain_outbox().await.unwrap();

    assert_eq!(drained, 2);
    assert_eq!(rig.engine.outbox_len(), 0);
    assert_eq!(rig.transport.saved_singles().len(), 2);
    assert_eq!(rig.engine.sync_state("Q1"), Some(SyncState::Synced));
    assert_eq!(rig.engine.sync_state("Q2"), Some(SyncState::Synced));
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_applies_newer_remote_records() {
    let rig = rig(fast_config());
    rig.engine.record(RecordedEdit::new("Q1", "local").at(60_000));

    rig.transport.set_remote_records(vec![
        RemoteRecord {
            item_key: "Q1".into(),
            value: "stale-remote".into(),
            note: None,
            attempt: 1,
            timestamp: 10_000,
        },
        RemoteRecord {
            item_key: "Q2".into(),
            value: "fresh-remote".into(),
            note: Some("from another device".into()),
            attempt: 3,
            timestamp: 70_000,
        },
    ]);

    rig.engine.reconcile_now().await;

    // The stale record lost last-write-wins; the fresh one landed
    assert_eq!(rig.engine.get("Q1").unwrap().value, "local");
    let merged = rig.engine.get("Q2").unwrap();
    assert_eq!(merged.value, "fresh-remote");
    assert_eq!(merged.attempt, 3);
    assert_eq!(merged.sync_state, SyncState::Synced);

    assert_eq!(rig.engine.last_successful_sync(), Some(rig.clock.now_ms()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_load_skips_cycle_and_keeps_watermark() {
    let rig = rig(fast_config());
    rig.transport.fail_next_loads(1);

    rig.engine.reconcile_now().await;
    assert_eq!(rig.engine.last_successful_sync(), None);

    rig.engine.reconcile_now().await;
    assert!(rig.engine.last_successful_sync().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_record_is_synchronous_and_invokes_persistence() {
    let transport = Arc::new(MockTransport::new());
    let persistence = Arc::new(CapturingPersistence::new());

    let engine = ProgressSyncBuilder::new()
        .with_transport(transport)
        .with_persistence(persistence.clone())
        .with_config(fast_config())
        .build()
        .unwrap();

    engine.record(RecordedEdit::new("Q1", "A").at(1000));

    // Before any flush or await, the optimistic write is visible and the
    // persistence hook has run
    assert_eq!(engine.get("Q1").unwrap().value, "A");
    assert_eq!(engine.sync_state("Q1"), Some(SyncState::Batched));
    assert_eq!(persistence.calls(), 1);
    assert_eq!(persistence.last_snapshot.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outbox_survives_engine_restart() {
    let dir = TempDir::new().unwrap();
    let outbox_path = dir.path().join("outbox.log");

    {
        let transport = Arc::new(MockTransport::new());
        let probe = Arc::new(SwitchableProbe::new(false));
        let engine = ProgressSyncBuilder::new()
            .with_transport(transport.clone())
            .with_connectivity_probe(probe)
            .with_token_provider(Arc::new(StaticTokenProvider::new(Some("t".into()))))
            .with_config(fast_config())
            .with_outbox_path(&outbox_path)
            .build()
            .unwrap();

        engine.record(RecordedEdit::new("Q1", "A").at(1000));
        engine.record(RecordedEdit::new("Q2", "B").at(1001));
        engine.flush().await;
        assert_eq!(engine.outbox_len(), 2);
        assert_eq!(transport.total_calls(), 0);
    }

    // A new engine instance over the same log finds and replays the queue
    let transport = Arc::new(MockTransport::new());
    let engine = ProgressSyncBuilder::new()
        .with_transport(transport.clone())
        .with_token_provider(Arc::new(StaticTokenProvider::new(Some("t".into()))))
        .with_config(fast_config())
        .with_outbox_path(&outbox_path)
        .build()
        .unwrap();

    assert_eq!(engine.outbox_len(), 2);
    let drained = engine.drain_outbox().await.unwrap();
    assert_eq!(drained, 2);
    assert_eq!(transport.saved_singles().len(), 2);
    assert_eq!(engine.outbox_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_for_successful_batch() {
    let rig = rig(fast_config());
    let mut rx = rig.engine.subscribe().unwrap();

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.record(RecordedEdit::new("Q2", "B").at(1001));
    rig.engine.flush().await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(events.contains(&LifecycleEvent::BatchStart { total: 2 }));
    assert!(events.contains(&LifecycleEvent::SyncStart { count: 2 }));
    assert!(events.contains(&LifecycleEvent::SyncSuccess { count: 2 }));
    assert!(events.contains(&LifecycleEvent::BatchComplete { total: 2 }));
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_when_queued_offline() {
    let rig = rig(fast_config());
    rig.probe.set_online(false);
    let mut rx = rig.engine.subscribe().unwrap();

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.flush().await;

    let mut saw_queued = false;
    while let Ok(event) = rx.try_recv() {
        if event == (LifecycleEvent::OfflineQueued { item_key: "Q1".into() }) {
            saw_queued = true;
        }
    }
    assert!(saw_queued);
}

/// Transport whose requests never complete; only a timeout gets past it
struct HangingTransport {
    attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl psync_engine::ProgressTransport for HangingTransport {
    async fn save(&self, _data: &psync_engine::SaveData, _token: &str) -> psync_engine::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn save_batch(
        &self,
        _request: &psync_engine::BatchSaveRequest,
        _token: &str,
    ) -> psync_engine::Result<psync_engine::BatchSaveResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn load_since(
        &self,
        _since_ms: Option<i64>,
        _token: &str,
    ) -> psync_engine::Result<Vec<RemoteRecord>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_hung_request_times_out_and_counts_as_attempt() {
    let transport = Arc::new(HangingTransport {
        attempts: AtomicUsize::new(0),
    });

    let engine = ProgressSyncBuilder::new()
        .with_transport(transport.clone())
        .with_token_provider(Arc::new(StaticTokenProvider::new(Some("t".into()))))
        .with_config(
            fast_config()
                .with_max_attempts(2)
                .with_request_timeout_ms(1_000),
        )
        .build()
        .unwrap();

    engine.record(RecordedEdit::new("Q1", "A").at(1000));
    engine.flush().await;

    // Both attempts timed out rather than hanging the retry loop forever,
    // and the batch fell back to the outbox
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(engine.outbox_len(), 1);
    assert_eq!(engine.sync_state("Q1"), Some(SyncState::QueuedOffline));
}

#[tokio::test(start_paused = true)]
async fn test_flush_with_empty_batch_is_noop() {
    let rig = rig(fast_config());
    rig.engine.flush().await;
    rig.engine.flush().await;
    assert_eq!(rig.transport.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_drains_and_reconciles() {
    let rig = rig(fast_config().with_sync_interval_ms(5_000));
    rig.probe.set_online(false);

    rig.engine.record(RecordedEdit::new("Q1", "A").at(1000));
    rig.engine.flush().await;
    assert_eq!(rig.engine.outbox_len(), 1);

    rig.probe.set_online(true);
    rig.engine.start();

    // One interval is enough for a tick to drain and pull
    tokio::time::sleep(Duration::from_millis(6_000)).await;

    assert_eq!(rig.engine.outbox_len(), 0);
    assert_eq!(rig.transport.saved_singles().len(), 1);
    assert!(rig.engine.last_successful_sync().is_some());

    rig.engine.stop().await;
}
