// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests for the task queue engine.
//!
//! Failures are injected with wrappers around the in-memory backends:
//! 1. **FailingRecordStore** - store writes fail for chosen keys, reads are counted
//! 2. **FailingRemoteCache** - the remote tier can be switched off mid-run
//! 3. **Raw record tampering** - garbage and stale data in the store
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use task_queue_engine::cache::tiered::queue_key;
use task_queue_engine::pool::{SharedStoreConnector, StoreConnector};
use task_queue_engine::storage::memory::{InMemoryCache, InMemoryStore};
use task_queue_engine::{
    QueueError, RecordStore, RemoteCache, ServiceBackends, ServiceState, StorageError, StoredRecord, Task,
    TaskEngineConfig, TaskQueueService, TaskType, WriteOutcome,
};

const TABLE: &str = "task_queues";

// =============================================================================
// Failure-injecting wrappers
// =============================================================================

/// Store whose writes fail for selected keys. Reads are counted so tests can
/// tell whether a value came from the cache or the store.
struct FailingRecordStore {
    inner: InMemoryStore,
    failing_keys: Mutex<HashSet<String>>,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl FailingRecordStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            failing_keys: Mutex::new(HashSet::new()),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    fn fail_writes_for(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    fn heal(&self) {
        self.failing_keys.lock().clear();
    }

    fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FailingRecordStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(table, key).await
    }

    async fn put_if_version(
        &self,
        table: &str,
        record: &StoredRecord,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.failing_keys.lock().contains(&record.key) {
            return Err(StorageError::Backend(format!("injected write failure for '{}'", record.key)));
        }
        self.inner.put_if_version(table, record, expected_version).await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        self.inner.delete(table, key).await
    }

    async fn scan_keys(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        self.inner.scan_keys(table, offset, limit).await
    }
}

/// Remote cache that can be taken down and brought back.
struct FailingRemoteCache {
    inner: InMemoryCache,
    down: AtomicBool,
    calls: AtomicU64,
}

impl FailingRemoteCache {
    fn new() -> Self {
        Self {
            inner: InMemoryCache::new(),
            down: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::Backend("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteCache for FailingRemoteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }
}

/// Connector for a store that never comes up.
struct UnreachableStore;

#[async_trait]
impl StoreConnector for UnreachableStore {
    async fn connect(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        Err(StorageError::Backend("store unreachable".to_string()))
    }
}

fn build(
    store: Arc<dyn RecordStore>,
    remote: Option<Arc<dyn RemoteCache>>,
    config: TaskEngineConfig,
) -> TaskQueueService {
    let (_tx, rx) = watch::channel(config.clone());
    TaskQueueService::with_backends(
        config,
        rx,
        ServiceBackends {
            connector: Some(Arc::new(SharedStoreConnector::new(store))),
            remote_cache: remote,
            ..Default::default()
        },
    )
}

fn task(id: &str) -> Task {
    Task::new(id, TaskType::Harvesting, "Gather herbs", 60_000)
}

// =============================================================================
// Remote cache outages
// =============================================================================

#[tokio::test]
async fn chaos_remote_cache_outage_degrades_to_local_tier() {
    let store = Arc::new(InMemoryStore::new());
    let remote = Arc::new(FailingRemoteCache::new());
    let service = build(store, Some(remote.clone()), TaskEngineConfig::default());
    service.start().await.unwrap();

    remote.set_down(true);
    // Every operation still succeeds; failures stay inside the cache layer
    service.add_task("p1", task("a")).await.unwrap();
    service.update_task_progress("p1", "a", 0.3).await.unwrap();
    let progress = service.get_task_progress("p1", "a").await.unwrap();
    assert!((progress.progress - 0.3).abs() < f64::EPSILON);

    let stats = service.cache_stats();
    assert!(stats.remote_errors > 0);
    assert!(stats.local_entries > 0);

    service.shutdown().await;
}

#[tokio::test]
async fn chaos_open_circuit_stops_calling_dead_remote() {
    let store = Arc::new(InMemoryStore::new());
    let remote = Arc::new(FailingRemoteCache::new());
    let service = build(store, Some(remote.clone()), TaskEngineConfig::default());
    service.start().await.unwrap();
    remote.set_down(true);

    for i in 0..10 {
        let _ = service.get_queue_status(&format!("ghost-{}", i)).await.unwrap();
    }
    let calls_after_trip = remote.calls();
    for i in 10..20 {
        let _ = service.get_queue_status(&format!("ghost-{}", i)).await.unwrap();
    }
    // Circuit is open: the dead remote is no longer hammered
    assert_eq!(remote.calls(), calls_after_trip);
    assert!(!service.cache_stats().remote_available);

    service.shutdown().await;
}

#[tokio::test]
async fn chaos_cache_miss_reads_store_then_repopulates() {
    let store = Arc::new(FailingRecordStore::new());

    let writer = build(store.clone(), None, TaskEngineConfig::default());
    writer.start().await.unwrap();
    writer.add_task("p1", task("a")).await.unwrap();
    writer.ensure_durable("p1").await.unwrap();
    writer.shutdown().await;

    let remote = Arc::new(InMemoryCache::new());
    let reader = build(store.clone(), Some(remote.clone()), TaskEngineConfig::default());
    reader.start().await.unwrap();
    let gets_before = store.gets();

    let status = reader.get_queue_status("p1").await.unwrap();
    assert!(status.exists);
    assert_eq!(store.gets(), gets_before + 1);
    assert!(remote.get(&queue_key("p1")).await.unwrap().is_some());

    // Second read is served by the cache
    let again = reader.get_queue_status("p1").await.unwrap();
    assert_eq!(again.version, status.version);
    assert_eq!(store.gets(), gets_before + 1);

    reader.shutdown().await;
}

// =============================================================================
// Batch failure isolation
// =============================================================================

#[tokio::test]
async fn chaos_one_failed_write_does_not_sink_its_batch() {
    let store = Arc::new(FailingRecordStore::new());
    store.fail_writes_for("cursed");
    let config = TaskEngineConfig {
        batch_max_size: 3,
        ..Default::default()
    };
    let service = build(store.clone(), None, config);
    service.start().await.unwrap();

    // The caller sees Queued for all three; the third add triggers the flush
    for player in ["alpha", "cursed", "omega"] {
        assert_eq!(service.add_task(player, task("a")).await.unwrap(), WriteOutcome::Queued);
    }

    assert!(store.get(TABLE, "alpha").await.unwrap().is_some());
    assert!(store.get(TABLE, "omega").await.unwrap().is_some());
    assert!(store.get(TABLE, "cursed").await.unwrap().is_none());

    let failures = service.take_batch_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "cursed");
    assert!(service.take_batch_failures().is_empty());
    assert_eq!(service.coalescer_stats().operations_failed, 1);

    // Reconciliation: still dirty in memory, durable once the store recovers
    assert!(service.get_queue_status("cursed").await.unwrap().has_unsaved_changes);
    assert!(matches!(
        service.ensure_durable("cursed").await,
        Err(QueueError::Storage(StorageError::Backend(_)))
    ));
    store.heal();
    assert_eq!(service.ensure_durable("cursed").await.unwrap(), Some(1));

    service.shutdown().await;
}

#[tokio::test]
async fn chaos_shutdown_reports_queues_it_could_not_save() {
    let store = Arc::new(FailingRecordStore::new());
    let service = build(store.clone(), None, TaskEngineConfig::default());
    service.start().await.unwrap();
    service.add_task("good", task("a")).await.unwrap();
    service.add_task("bad", task("a")).await.unwrap();
    store.fail_writes_for("bad");

    let report = service.shutdown().await;
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(report.persist_failures, 1);
    assert!(store.get(TABLE, "good").await.unwrap().is_some());
    assert!(store.get(TABLE, "bad").await.unwrap().is_none());
}

// =============================================================================
// Concurrent writers and corrupted data
// =============================================================================

#[tokio::test]
async fn chaos_stale_writer_gets_conflict_then_recovers() {
    let store = Arc::new(InMemoryStore::new());
    let process_a = build(store.clone(), None, TaskEngineConfig::default());
    let process_b = build(store.clone(), None, TaskEngineConfig::default());
    process_a.start().await.unwrap();
    process_b.start().await.unwrap();

    process_a.add_task("p1", task("a")).await.unwrap();
    process_a.ensure_durable("p1").await.unwrap();

    // Both processes hold version 1
    assert_eq!(process_b.load_queue("p1").await.unwrap().unwrap().version, 1);
    assert_eq!(
        process_a.stop_all_tasks("p1").await.unwrap(),
        Some(WriteOutcome::PersistedImmediately { version: 2 })
    );

    let err = process_b.stop_all_tasks("p1").await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::ConcurrencyConflict { expected: 1, actual: Some(2), .. }
    ));
    assert_eq!(process_b.concurrency_conflicts(), 1);

    // The stale copy was dropped; the next access reloads the winner
    let reloaded = process_b.load_queue("p1").await.unwrap().unwrap();
    assert_eq!(reloaded.version, 2);
    assert_eq!(
        process_b.stop_all_tasks("p1").await.unwrap(),
        Some(WriteOutcome::PersistedImmediately { version: 3 })
    );

    process_a.shutdown().await;
    process_b.shutdown().await;
}

#[tokio::test]
async fn chaos_tampered_record_is_rejected_as_corruption() {
    let store = Arc::new(InMemoryStore::new());
    let service = build(store.clone(), None, TaskEngineConfig::default());
    service.start().await.unwrap();
    service.add_task("p1", task("a")).await.unwrap();
    service.ensure_durable("p1").await.unwrap();
    service.shutdown().await;

    let mut record = store.get(TABLE, "p1").await.unwrap().unwrap();
    record.body = record.body.replace("\"totalTasksCompleted\":0", "\"totalTasksCompleted\":999");
    store.insert_raw(TABLE, record);

    let fresh = build(store.clone(), None, TaskEngineConfig::default());
    fresh.start().await.unwrap();
    let err = fresh.load_queue("p1").await.unwrap_err();
    assert!(matches!(err, QueueError::Storage(StorageError::Corruption { .. })), "{:?}", err);

    store.insert_raw(
        TABLE,
        StoredRecord {
            key: "p2".to_string(),
            version: 1,
            body: "{not json".to_string(),
            updated_at: 0,
        },
    );
    assert!(matches!(
        fresh.load_queue("p2").await,
        Err(QueueError::Storage(StorageError::Serialization(_)))
    ));
    fresh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_unreachable_store_aborts_start() {
    let config = TaskEngineConfig::default();
    let (_tx, rx) = watch::channel(config.clone());
    let service = TaskQueueService::with_backends(
        config,
        rx,
        ServiceBackends {
            connector: Some(Arc::new(UnreachableStore)),
            ..Default::default()
        },
    );

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, StorageError::Backend(_)));
    assert_eq!(service.state(), ServiceState::Created);
}
