// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resident queue ownership.
//!
//! Every player with recent activity has exactly one in-memory queue,
//! guarded by its own async mutex. The API, the flush executor and the
//! progress debouncer all go through [`QueueCore`]; nothing else touches
//! the map.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::TieredCache;
use crate::persistence::{IntegrityReport, PersistenceService};
use crate::queue::{QueueConfig, QueueError, TaskQueue};

pub(crate) struct ResidentQueue {
    pub queue: TaskQueue,
    /// In-memory changes not yet confirmed durable
    pub dirty: bool,
}

pub(crate) type QueueSlot = Arc<Mutex<ResidentQueue>>;

pub(crate) struct QueueCore {
    active: DashMap<String, QueueSlot>,
    persistence: PersistenceService,
    cache: Arc<TieredCache>,
    max_history_size: usize,
    saves: AtomicU64,
    conflicts: AtomicU64,
    integrity_failures: AtomicU64,
}

impl QueueCore {
    pub fn new(persistence: PersistenceService, cache: Arc<TieredCache>, max_history_size: usize) -> Self {
        Self {
            active: DashMap::new(),
            persistence,
            cache,
            max_history_size,
            saves: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &str {
        self.persistence.table()
    }

    pub fn persistence(&self) -> &PersistenceService {
        &self.persistence
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn slot(&self, player_id: &str) -> Option<QueueSlot> {
        self.active.get(player_id).map(|s| s.clone())
    }

    pub fn resident_players(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn resident_count(&self) -> usize {
        self.active.len()
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }

    /// Find a queue without creating one: cache first, then the store.
    /// A cached copy whose checksum does not match its content is dropped.
    /// A store hit repopulates the cache.
    pub async fn fetch(&self, player_id: &str) -> Result<Option<TaskQueue>, QueueError> {
        if let Some(queue) = self.cache.get_cached_queue_state(player_id).await {
            if queue.player_id != player_id {
                warn!(player_id, cached = %queue.player_id, "Cached queue belongs to another player, ignoring");
            } else if !queue.verify_checksum() {
                self.integrity_failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_integrity_failure(self.table());
                warn!(player_id, "Cached queue failed checksum, reloading from store");
                self.cache.invalidate_queue(player_id).await;
            } else {
                return Ok(Some(queue));
            }
        }
        let loaded = self.persistence.load_queue(player_id).await?;
        if let Some(queue) = &loaded {
            self.cache.cache_active_queue_state(queue).await;
        }
        Ok(loaded)
    }

    /// The resident slot, loading it (cache, then store) when absent.
    /// With `create`, a player with no queue anywhere gets a fresh one.
    pub async fn load_or_create(&self, player_id: &str, create: bool) -> Result<Option<QueueSlot>, QueueError> {
        if let Some(slot) = self.slot(player_id) {
            return Ok(Some(slot));
        }
        let queue = match self.fetch(player_id).await? {
            Some(queue) => queue,
            None if create => {
                debug!(player_id, "Creating new queue");
                TaskQueue::with_config(player_id, QueueConfig::default(), self.max_history_size)
            }
            None => return Ok(None),
        };

        // Another caller may have loaded it while we were waiting on I/O
        let slot = self
            .active
            .entry(player_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ResidentQueue { queue, dirty: false })))
            .clone();
        crate::metrics::set_active_queues(self.active.len());
        Ok(Some(slot))
    }

    /// Write a resident queue now. On a version conflict the resident copy
    /// is dropped and the cache invalidated, so the next access reloads.
    pub async fn persist_now(&self, resident: &mut ResidentQueue) -> Result<u64, QueueError> {
        match self.persistence.save_queue_with_atomic_update(&mut resident.queue).await {
            Ok(version) => {
                resident.dirty = false;
                self.saves.fetch_add(1, Ordering::Relaxed);
                self.cache.cache_active_queue_state(&resident.queue).await;
                Ok(version)
            }
            Err(e @ QueueError::ConcurrencyConflict { .. }) => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                let player_id = resident.queue.player_id.clone();
                self.active.remove(&player_id);
                self.cache.invalidate_queue(&player_id).await;
                crate::metrics::set_active_queues(self.active.len());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Flush path: write the resident queue if it has unsaved changes.
    ///
    /// A player that is no longer resident falls back to `snapshot` (the
    /// state captured when the write was queued); the version check keeps a
    /// stale snapshot from overwriting newer data.
    pub async fn persist_if_dirty(
        &self,
        player_id: &str,
        snapshot: Option<&TaskQueue>,
    ) -> Result<Option<u64>, QueueError> {
        if let Some(slot) = self.slot(player_id) {
            let mut resident = slot.lock().await;
            if !resident.dirty {
                return Ok(None);
            }
            return self.persist_now(&mut resident).await.map(Some);
        }
        match snapshot {
            Some(snapshot) => {
                let mut queue = snapshot.clone();
                let version = self.persistence.save_queue_with_atomic_update(&mut queue).await?;
                self.saves.fetch_add(1, Ordering::Relaxed);
                self.cache.cache_active_queue_state(&queue).await;
                Ok(Some(version))
            }
            None => {
                debug!(player_id, "Nothing resident to persist");
                Ok(None)
            }
        }
    }

    /// Drop the record everywhere: store, resident map, cache.
    pub async fn delete(&self, player_id: &str) -> Result<(), QueueError> {
        self.persistence.delete_queue(player_id).await?;
        self.active.remove(player_id);
        self.cache.invalidate_queue(player_id).await;
        crate::metrics::set_active_queues(self.active.len());
        Ok(())
    }

    /// Append a history snapshot and check the queue against its stored record.
    pub async fn snapshot_and_validate(&self, player_id: &str) -> Result<Option<IntegrityReport>, QueueError> {
        let Some(slot) = self.slot(player_id) else {
            return Ok(None);
        };
        let copy = {
            let mut resident = slot.lock().await;
            self.persistence.create_state_snapshot(&mut resident.queue);
            resident.queue.clone()
        };
        let report = self.persistence.validate_queue_integrity(&copy).await?;
        if !report.is_valid() {
            self.integrity_failures.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_integrity_failure(self.table());
            warn!(player_id, violations = ?report.violations, "Queue failed integrity check");
        }
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tiered::queue_key;
    use crate::cache::CacheClass;
    use crate::config::TaskEngineConfig;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::RecordStore;
    use crate::task::{Task, TaskType};

    fn core_with(store: Arc<InMemoryStore>) -> QueueCore {
        let pool = Arc::new(ConnectionPool::shared(store, PoolConfig::default()));
        let cache = Arc::new(TieredCache::new(&TaskEngineConfig::default()));
        QueueCore::new(PersistenceService::new(pool, "task_queues"), cache, 10)
    }

    #[tokio::test]
    async fn test_load_or_create_respects_flag() {
        let core = core_with(Arc::new(InMemoryStore::new()));
        assert!(core.load_or_create("p1", false).await.unwrap().is_none());
        let slot = core.load_or_create("p1", true).await.unwrap().unwrap();
        assert_eq!(slot.lock().await.queue.version, 0);
        assert_eq!(core.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_store_hit_repopulates_cache() {
        let store = Arc::new(InMemoryStore::new());
        let writer = core_with(store.clone());
        let slot = writer.load_or_create("p1", true).await.unwrap().unwrap();
        {
            let mut resident = slot.lock().await;
            resident.queue.enqueue(Task::new("a", TaskType::Combat, "Fight", 500), 1).unwrap();
            writer.persist_now(&mut resident).await.unwrap();
        }

        let reader = core_with(store);
        assert!(reader.cache().get_cached_queue_state("p1").await.is_none());
        let loaded = reader.fetch("p1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert!(reader.cache().get_cached_queue_state("p1").await.is_some());
    }

    #[tokio::test]
    async fn test_corrupted_cache_entry_falls_back_to_store() {
        let store = Arc::new(InMemoryStore::new());
        let core = core_with(store);
        let slot = core.load_or_create("p1", true).await.unwrap().unwrap();
        let mut saved = {
            let mut resident = slot.lock().await;
            resident.queue.enqueue(Task::new("a", TaskType::Combat, "Fight", 500), 1).unwrap();
            core.persist_now(&mut resident).await.unwrap();
            resident.queue.clone()
        };

        // Same version, different content, stale checksum
        saved.total_tasks_completed = 99;
        core.cache()
            .set_raw(CacheClass::ActiveQueue, &queue_key("p1"), serde_json::to_string(&saved).unwrap())
            .await;

        let loaded = core.fetch("p1").await.unwrap().unwrap();
        assert_eq!(loaded.total_tasks_completed, 0);
        assert!(loaded.verify_checksum());
        assert_eq!(core.integrity_failures(), 1);
    }

    #[tokio::test]
    async fn test_unsaved_changes_are_cached_with_matching_checksum() {
        let core = core_with(Arc::new(InMemoryStore::new()));
        let mut queue = TaskQueue::new("p1");
        queue.enqueue(Task::new("a", TaskType::Crafting, "Forge", 500), 0).unwrap();
        assert!(!queue.verify_checksum());

        core.cache().cache_active_queue_state(&queue).await;
        let cached = core.fetch("p1").await.unwrap().unwrap();
        assert_eq!(cached.queued_tasks.len(), 1);
        assert_eq!(core.integrity_failures(), 0);
    }

    #[tokio::test]
    async fn test_persist_if_dirty_skips_clean_queue() {
        let store = Arc::new(InMemoryStore::new());
        let core = core_with(store.clone());
        let slot = core.load_or_create("p1", true).await.unwrap().unwrap();
        assert_eq!(core.persist_if_dirty("p1", None).await.unwrap(), None);

        slot.lock().await.dirty = true;
        assert_eq!(core.persist_if_dirty("p1", None).await.unwrap(), Some(1));
        assert!(!slot.lock().await.dirty);
        assert_eq!(store.get("task_queues", "p1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_conflict_evicts_resident_copy() {
        let store = Arc::new(InMemoryStore::new());
        let a = core_with(store.clone());
        let b = core_with(store);

        let slot_a = a.load_or_create("p1", true).await.unwrap().unwrap();
        let slot_b = b.load_or_create("p1", true).await.unwrap().unwrap();
        a.persist_now(&mut *slot_a.lock().await).await.unwrap();

        let err = b.persist_now(&mut *slot_b.lock().await).await.unwrap_err();
        assert!(matches!(err, QueueError::ConcurrencyConflict { .. }));
        assert_eq!(b.resident_count(), 0);
        assert_eq!(b.conflicts(), 1);

        let reloaded = b.load_or_create("p1", false).await.unwrap().unwrap();
        assert_eq!(reloaded.lock().await.queue.version, 1);
    }

    #[tokio::test]
    async fn test_snapshot_and_validate_appends_history() {
        let core = core_with(Arc::new(InMemoryStore::new()));
        let slot = core.load_or_create("p1", true).await.unwrap().unwrap();
        core.persist_now(&mut *slot.lock().await).await.unwrap();

        let report = core.snapshot_and_validate("p1").await.unwrap().unwrap();
        assert!(report.is_valid());
        assert_eq!(slot.lock().await.queue.state_history.len(), 1);
        assert!(core.snapshot_and_validate("ghost").await.unwrap().is_none());
    }
}
