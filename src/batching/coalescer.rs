// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write coalescer: groups pending writes by `(table, operation type)`.
//!
//! ```text
//! add_to_batch ──► HybridBatcher per BatchKey ──(count | age)──► flush
//!                                                                  │
//!                                 Semaphore (max concurrent) ◄─────┘
//!                                          │
//!                          BatchExecutor::execute, one op at a time
//! ```
//!
//! A failing operation is logged, counted, and recorded in a bounded
//! failure ledger; the rest of its batch still runs. Failed operations are
//! not retried. Callers reconcile through [`WriteCoalescer::take_failures`]
//! or by forcing a synchronous write.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::hybrid_batcher::{BatchConfig, FlushBatch, FlushReason, HybridBatcher};
use super::operation::{BatchKey, BatchOpType, BatchOperation};
use crate::config::{TaskEngineConfig, DEFAULT_FAILURE_LEDGER_SIZE};
use crate::queue::QueueError;

/// Executes one batched operation against durable storage.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, op: &BatchOperation) -> Result<(), QueueError>;
}

/// One operation that failed during a flush.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub operation_id: uuid::Uuid,
    pub table_name: String,
    pub key: String,
    pub op_type: BatchOpType,
    pub error: String,
    pub failed_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    pub pending_operations: usize,
    pub pending_batches: usize,
    pub batches_flushed: u64,
    pub operations_flushed: u64,
    pub operations_failed: u64,
    pub operations_cancelled: u64,
}

struct CoalescerInner {
    batches: Mutex<HashMap<BatchKey, HybridBatcher<BatchOperation>>>,
    config: BatchConfig,
    executor: Arc<dyn BatchExecutor>,
    semaphore: Arc<Semaphore>,
    failures: Mutex<VecDeque<BatchFailure>>,
    max_failures: usize,
    batches_flushed: AtomicU64,
    operations_flushed: AtomicU64,
    operations_failed: AtomicU64,
    operations_cancelled: AtomicU64,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WriteCoalescer {
    inner: Arc<CoalescerInner>,
}

impl WriteCoalescer {
    pub fn new(config: BatchConfig, max_concurrent: usize, executor: Arc<dyn BatchExecutor>) -> Self {
        Self::with_failure_ledger(config, max_concurrent, DEFAULT_FAILURE_LEDGER_SIZE, executor)
    }

    /// Coalescer using the batch settings of an engine config.
    pub fn from_config(config: &TaskEngineConfig, executor: Arc<dyn BatchExecutor>) -> Self {
        Self::with_failure_ledger(
            BatchConfig::from(config),
            config.batch_max_concurrent,
            config.batch_failure_ledger_size,
            executor,
        )
    }

    /// Keep at most `max_failures` entries for [`take_failures`](Self::take_failures),
    /// dropping the oldest first.
    pub fn with_failure_ledger(
        config: BatchConfig,
        max_concurrent: usize,
        max_failures: usize,
        executor: Arc<dyn BatchExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                batches: Mutex::new(HashMap::new()),
                config,
                executor,
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                failures: Mutex::new(VecDeque::new()),
                max_failures: max_failures.max(1),
                batches_flushed: AtomicU64::new(0),
                operations_flushed: AtomicU64::new(0),
                operations_failed: AtomicU64::new(0),
                operations_cancelled: AtomicU64::new(0),
            }),
        }
    }

    /// Queue an operation. Flushes its batch inline once the size threshold is hit.
    pub async fn add_to_batch(&self, op: BatchOperation) {
        let key = op.batch_key();
        let ready = {
            let mut batches = self.inner.batches.lock();
            let batcher = batches
                .entry(key.clone())
                .or_insert_with(|| HybridBatcher::new(self.inner.config.clone()));
            match batcher.add(op) {
                Some(_) => batcher.take_if_ready(),
                None => None,
            }
        };
        crate::metrics::set_batch_pending(self.pending_count());

        if let Some(batch) = ready {
            self.inner.clone().flush_batch(key, batch).await;
        }
    }

    /// Flush every batch whose count or age threshold has been reached.
    /// Returns the number of operations attempted.
    pub async fn flush_ready(&self) -> usize {
        let ready: Vec<(BatchKey, FlushBatch<BatchOperation>)> = {
            let mut batches = self.inner.batches.lock();
            batches
                .iter_mut()
                .filter_map(|(key, batcher)| batcher.take_if_ready().map(|b| (key.clone(), b)))
                .collect()
        };
        self.run_batches(ready).await
    }

    /// Flush everything pending regardless of thresholds.
    pub async fn flush_all(&self, reason: FlushReason) -> usize {
        let pending: Vec<(BatchKey, FlushBatch<BatchOperation>)> = {
            let mut batches = self.inner.batches.lock();
            batches
                .iter_mut()
                .filter_map(|(key, batcher)| batcher.force_flush_with_reason(reason).map(|b| (key.clone(), b)))
                .collect()
        };
        self.run_batches(pending).await
    }

    async fn run_batches(&self, batches: Vec<(BatchKey, FlushBatch<BatchOperation>)>) -> usize {
        if batches.is_empty() {
            return 0;
        }
        let total: usize = batches.iter().map(|(_, b)| b.items.len()).sum();

        let mut set = JoinSet::new();
        for (key, batch) in batches {
            let inner = self.inner.clone();
            set.spawn(async move { inner.flush_batch(key, batch).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Batch flush task panicked");
            }
        }
        crate::metrics::set_batch_pending(self.pending_count());
        total
    }

    /// Drop pending operations for one record (superseded by a synchronous write).
    pub fn cancel_pending(&self, table_name: &str, key: &str) -> usize {
        let mut batches = self.inner.batches.lock();
        let cancelled: usize = batches
            .iter_mut()
            .filter(|(batch_key, _)| batch_key.table_name == table_name)
            .map(|(_, batcher)| batcher.remove_key(key))
            .sum();
        if cancelled > 0 {
            debug!(table_name, key, cancelled, "Pending batched writes cancelled");
            self.inner
                .operations_cancelled
                .fetch_add(cancelled as u64, Ordering::Relaxed);
        }
        cancelled
    }

    #[must_use]
    pub fn has_pending(&self, table_name: &str, key: &str) -> bool {
        self.inner
            .batches
            .lock()
            .iter()
            .any(|(batch_key, batcher)| batch_key.table_name == table_name && batcher.contains(key))
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.batches.lock().values().map(HybridBatcher::len).sum()
    }

    /// Drain the failure ledger.
    pub fn take_failures(&self) -> Vec<BatchFailure> {
        self.inner.failures.lock().drain(..).collect()
    }

    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        let batches = self.inner.batches.lock();
        CoalescerStats {
            pending_operations: batches.values().map(HybridBatcher::len).sum(),
            pending_batches: batches.values().filter(|b| !b.is_empty()).count(),
            batches_flushed: self.inner.batches_flushed.load(Ordering::Relaxed),
            operations_flushed: self.inner.operations_flushed.load(Ordering::Relaxed),
            operations_failed: self.inner.operations_failed.load(Ordering::Relaxed),
            operations_cancelled: self.inner.operations_cancelled.load(Ordering::Relaxed),
        }
    }
}

impl CoalescerInner {
    async fn flush_batch(self: Arc<Self>, key: BatchKey, batch: FlushBatch<BatchOperation>) {
        // Never closed, so acquire only fails if that invariant breaks
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        };

        let start = Instant::now();
        let count = batch.items.len();
        let mut failed = 0usize;

        for op in &batch.items {
            if let Err(e) = self.executor.execute(op).await {
                failed += 1;
                warn!(
                    batch = %key,
                    key = %op.key,
                    op_id = %op.id,
                    error = %e,
                    "Batched operation failed; continuing with the rest of the batch"
                );
                crate::metrics::record_batch_operation_failure(&key.table_name, op.op_type().as_str());
                self.record_failure(op, &e);
            }
        }

        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.operations_flushed.fetch_add((count - failed) as u64, Ordering::Relaxed);
        self.operations_failed.fetch_add(failed as u64, Ordering::Relaxed);
        crate::metrics::record_batch_flush(key.op_type.as_str(), batch.reason.as_str(), count, start.elapsed());
        debug!(batch = %key, count, failed, reason = batch.reason.as_str(), "Batch flushed");
    }

    fn record_failure(&self, op: &BatchOperation, err: &QueueError) {
        let mut failures = self.failures.lock();
        if failures.len() >= self.max_failures {
            failures.pop_front();
        }
        failures.push_back(BatchFailure {
            operation_id: op.id,
            table_name: op.table_name.clone(),
            key: op.key.clone(),
            op_type: op.op_type(),
            error: err.to_string(),
            failed_at: crate::task::epoch_millis(),
        });
    }
}
