// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bridges from the write coalescer and the progress debouncer back to
//! resident queue state.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::debounce::DebounceTarget;
use super::resident::QueueCore;
use crate::batching::{BatchExecutor, BatchOperation, BatchPayload, WriteCoalescer};
use crate::queue::QueueError;

/// Executes coalesced writes against the persistence service.
///
/// Queued writes carry a snapshot, but a flush always writes the newest
/// resident state; several queued writes for one player collapse into a
/// single save followed by no-ops.
pub(crate) struct QueueWriteExecutor {
    core: Arc<QueueCore>,
}

impl QueueWriteExecutor {
    pub fn new(core: Arc<QueueCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl BatchExecutor for QueueWriteExecutor {
    async fn execute(&self, op: &BatchOperation) -> Result<(), QueueError> {
        if op.table_name != self.core.table() {
            return Err(QueueError::InvalidState(format!(
                "operation targets table '{}', service owns '{}'",
                op.table_name,
                self.core.table()
            )));
        }
        match &op.payload {
            BatchPayload::Delete => self.core.delete(&op.key).await,
            BatchPayload::Add { queue } | BatchPayload::Update { queue } => {
                let written = self.core.persist_if_dirty(&op.key, Some(queue)).await?;
                debug!(key = %op.key, op = %op.op_type(), ?written, "Batched queue write");
                Ok(())
            }
            BatchPayload::Remove { task_id } => {
                let written = self.core.persist_if_dirty(&op.key, None).await?;
                debug!(key = %op.key, task_id, ?written, "Batched task removal");
                Ok(())
            }
        }
    }
}

/// Debounce target: hands a player's settled progress to the coalescer.
pub(crate) struct ProgressFlusher {
    core: Arc<QueueCore>,
    coalescer: WriteCoalescer,
}

impl ProgressFlusher {
    pub fn new(core: Arc<QueueCore>, coalescer: WriteCoalescer) -> Self {
        Self { core, coalescer }
    }
}

#[async_trait]
impl DebounceTarget for ProgressFlusher {
    async fn fire(&self, player_id: &str) {
        let Some(slot) = self.core.slot(player_id) else {
            return;
        };
        // Built under the lock, submitted after: an inline flush re-locks the slot
        let op = {
            let resident = slot.lock().await;
            if !resident.dirty {
                return;
            }
            BatchOperation::update(self.core.table(), &resident.queue, 0)
        };
        match op {
            Ok(op) => self.coalescer.add_to_batch(op).await,
            Err(e) => warn!(player_id, error = %e, "Could not queue debounced progress write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::{BatchConfig, FlushReason};
    use crate::cache::TieredCache;
    use crate::config::TaskEngineConfig;
    use crate::persistence::PersistenceService;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::queue::TaskQueue;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::RecordStore;

    fn setup() -> (Arc<InMemoryStore>, Arc<QueueCore>) {
        let store = Arc::new(InMemoryStore::new());
        let pool = Arc::new(ConnectionPool::shared(store.clone(), PoolConfig::default()));
        let cache = Arc::new(TieredCache::new(&TaskEngineConfig::default()));
        let core = Arc::new(QueueCore::new(PersistenceService::new(pool, "task_queues"), cache, 10));
        (store, core)
    }

    #[tokio::test]
    async fn test_update_writes_resident_state() {
        let (store, core) = setup();
        let executor = QueueWriteExecutor::new(core.clone());
        let slot = core.load_or_create("p1", true).await.unwrap().unwrap();
        let op = {
            let mut resident = slot.lock().await;
            resident.dirty = true;
            BatchOperation::update("task_queues", &resident.queue, 0).unwrap()
        };

        executor.execute(&op).await.unwrap();
        assert_eq!(store.get("task_queues", "p1").await.unwrap().unwrap().version, 1);

        // Second write for the same state is a no-op
        executor.execute(&op).await.unwrap();
        assert_eq!(store.get("task_queues", "p1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_non_resident_falls_back_to_snapshot() {
        let (store, core) = setup();
        let executor = QueueWriteExecutor::new(core);
        let queue = TaskQueue::new("p9");
        let op = BatchOperation::add("task_queues", &queue, 0).unwrap();
        executor.execute(&op).await.unwrap();
        assert!(store.get("task_queues", "p9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_foreign_table_is_rejected() {
        let (_store, core) = setup();
        let executor = QueueWriteExecutor::new(core);
        let op = BatchOperation::delete("other_table", "p1", 0).unwrap();
        assert!(matches!(executor.execute(&op).await, Err(QueueError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_progress_flusher_queues_dirty_state_only() {
        let (store, core) = setup();
        let coalescer = WriteCoalescer::new(
            BatchConfig::default(),
            2,
            Arc::new(QueueWriteExecutor::new(core.clone())),
        );
        let flusher = ProgressFlusher::new(core.clone(), coalescer.clone());

        let slot = core.load_or_create("p1", true).await.unwrap().unwrap();
        flusher.fire("p1").await;
        assert_eq!(coalescer.pending_count(), 0);

        slot.lock().await.dirty = true;
        flusher.fire("p1").await;
        assert_eq!(coalescer.pending_count(), 1);

        coalescer.flush_all(FlushReason::Shutdown).await;
        assert_eq!(store.get("task_queues", "p1").await.unwrap().unwrap().version, 1);
    }
}
