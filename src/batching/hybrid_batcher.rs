// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Count-or-age batching of pending writes.
//!
//! The coalescer keeps one [`HybridBatcher`] per `(table, op)` pair. A batch
//! is ready once it holds `flush_count` writes or its oldest write is
//! `flush_ms` old. Pending writes are ordered by descending priority, ties in
//! arrival order, and a second write for the same record key replaces the
//! first so a flush never saves one queue twice.
//!
//! ```
//! use task_queue_engine::{HybridBatcher, BatchConfig, BatchableItem, FlushReason};
//!
//! #[derive(Debug)]
//! struct Save { key: String, priority: i32 }
//! impl BatchableItem for Save {
//!     fn key(&self) -> &str { &self.key }
//!     fn priority(&self) -> i32 { self.priority }
//!     fn set_priority(&mut self, priority: i32) { self.priority = priority; }
//! }
//!
//! let mut batcher = HybridBatcher::new(BatchConfig { flush_ms: 5_000, flush_count: 2 });
//! assert_eq!(batcher.add(Save { key: "queue:p1".into(), priority: 0 }), None);
//! assert_eq!(batcher.add(Save { key: "queue:p2".into(), priority: 9 }), Some(FlushReason::Count));
//!
//! let batch = batcher.take_if_ready().unwrap();
//! assert_eq!(batch.items[0].key, "queue:p2");
//! ```

use std::time::{Duration, Instant};
use tracing::debug;

/// What caused a batch to leave the batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Time,
    Count,
    /// `flush_all` from a caller.
    Manual,
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Age of the oldest pending write that makes the batch due.
    pub flush_ms: u64,
    pub flush_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_ms: 5_000,
            flush_count: 25,
        }
    }
}

impl From<&crate::config::TaskEngineConfig> for BatchConfig {
    fn from(config: &crate::config::TaskEngineConfig) -> Self {
        Self {
            flush_ms: config.batch_timeout_ms,
            flush_count: config.batch_max_size.max(1),
        }
    }
}

/// A pending write the batcher can coalesce and order.
pub trait BatchableItem {
    /// Record key; two items with the same key are the same write.
    fn key(&self) -> &str;
    fn priority(&self) -> i32;
    fn set_priority(&mut self, priority: i32);
}

/// Writes handed to the executor together.
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
}

pub struct HybridBatcher<T> {
    config: BatchConfig,
    pending: Vec<T>,
    oldest: Option<Instant>,
}

impl<T: BatchableItem> HybridBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            oldest: None,
        }
    }

    /// Queue `item`, returning [`FlushReason::Count`] once the batch is full.
    ///
    /// If a write for the same key is already pending it is dropped and
    /// `item` inherits its priority when that was higher. The age clock is
    /// not reset, so a record that keeps changing still flushes on time.
    pub fn add(&mut self, mut item: T) -> Option<FlushReason> {
        if let Some(idx) = self.pending.iter().position(|p| p.key() == item.key()) {
            let superseded = self.pending.remove(idx);
            item.set_priority(item.priority().max(superseded.priority()));
            debug!(key = item.key(), "Pending write superseded");
        }

        let priority = item.priority();
        let slot = self
            .pending
            .iter()
            .position(|p| p.priority() < priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(slot, item);
        self.oldest.get_or_insert_with(Instant::now);

        self.is_full().then_some(FlushReason::Count)
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.config.flush_count
    }

    fn is_due(&self) -> bool {
        !self.pending.is_empty() && self.age() >= Duration::from_millis(self.config.flush_ms)
    }

    /// How long the oldest pending write has waited.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.oldest.map(|at| at.elapsed()).unwrap_or_default()
    }

    /// Hand over the pending writes if the batch is full or due.
    pub fn take_if_ready(&mut self) -> Option<FlushBatch<T>> {
        let reason = if self.is_full() {
            FlushReason::Count
        } else if self.is_due() {
            FlushReason::Time
        } else {
            return None;
        };
        let batch = self.drain(reason);
        debug!(count = batch.items.len(), reason = reason.as_str(), "Batch ready");
        Some(batch)
    }

    /// Hand over whatever is pending, ignoring thresholds.
    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        (!self.pending.is_empty()).then(|| self.drain(reason))
    }

    fn drain(&mut self, reason: FlushReason) -> FlushBatch<T> {
        self.oldest = None;
        FlushBatch {
            items: std::mem::take(&mut self.pending),
            reason,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pending.iter().any(|p| p.key() == key)
    }

    /// Cancel the pending write for `key`, if any. Returns the number dropped.
    pub fn remove_key(&mut self, key: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| p.key() != key);
        if self.pending.is_empty() {
            self.oldest = None;
        }
        before - self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[derive(Debug, Clone, PartialEq)]
    struct QueueSave {
        player: String,
        priority: i32,
        version: u64,
    }

    impl BatchableItem for QueueSave {
        fn key(&self) -> &str {
            &self.player
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn set_priority(&mut self, priority: i32) {
            self.priority = priority;
        }
    }

    fn save(player: &str, priority: i32, version: u64) -> QueueSave {
        QueueSave { player: player.to_string(), priority, version }
    }

    fn roomy() -> BatchConfig {
        BatchConfig { flush_ms: 60_000, flush_count: 100 }
    }

    fn players(batch: &FlushBatch<QueueSave>) -> Vec<&str> {
        batch.items.iter().map(|s| s.player.as_str()).collect()
    }

    #[test]
    fn new_batcher_has_nothing_to_flush() {
        let mut batcher: HybridBatcher<QueueSave> = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.is_empty());
        assert_eq!(batcher.age(), Duration::ZERO);
        assert!(batcher.take_if_ready().is_none());
    }

    #[test]
    fn completions_flush_ahead_of_appends_in_arrival_order() {
        let mut batcher = HybridBatcher::new(roomy());
        batcher.add(save("append", 0, 1));
        batcher.add(save("complete", 5, 1));
        batcher.add(save("pause-1", 3, 1));
        batcher.add(save("pause-2", 3, 1));

        let batch = batcher.force_flush_with_reason(FlushReason::Manual).unwrap();
        assert_eq!(players(&batch), vec!["complete", "pause-1", "pause-2", "append"]);
        assert_eq!(batch.reason, FlushReason::Manual);
    }

    #[test]
    fn newer_save_replaces_pending_one_and_keeps_urgency() {
        let mut batcher = HybridBatcher::new(roomy());
        batcher.add(save("p1", 7, 1));
        batcher.add(save("p2", 1, 1));
        batcher.add(save("p1", 0, 2));

        assert_eq!(batcher.len(), 2);
        let batch = batcher.force_flush_with_reason(FlushReason::Manual).unwrap();
        assert_eq!(batch.items[0], save("p1", 7, 2));
    }

    #[test]
    fn full_batch_is_ready_immediately() {
        let mut batcher = HybridBatcher::new(BatchConfig { flush_ms: 60_000, flush_count: 3 });
        assert_eq!(batcher.add(save("a", 0, 1)), None);
        assert_eq!(batcher.add(save("b", 0, 1)), None);
        assert_eq!(batcher.add(save("c", 0, 1)), Some(FlushReason::Count));

        let batch = batcher.take_if_ready().unwrap();
        assert_eq!(batch.reason, FlushReason::Count);
        assert_eq!(batch.items.len(), 3);
        assert!(batcher.is_empty());
    }

    #[test]
    fn age_counts_from_first_pending_write() {
        let mut batcher = HybridBatcher::new(BatchConfig { flush_ms: 20, flush_count: 100 });
        batcher.add(save("a", 0, 1));
        assert!(batcher.take_if_ready().is_none());

        sleep(Duration::from_millis(30));
        batcher.add(save("a", 0, 2));
        let batch = batcher.take_if_ready().unwrap();
        assert_eq!(batch.reason, FlushReason::Time);
        assert_eq!(batch.items, vec![save("a", 0, 2)]);
        assert_eq!(batcher.age(), Duration::ZERO);
    }

    #[test]
    fn cancelled_write_leaves_the_batch() {
        let mut batcher = HybridBatcher::new(roomy());
        batcher.add(save("p1", 0, 1));
        batcher.add(save("p2", 0, 1));

        assert!(batcher.contains("p1"));
        assert_eq!(batcher.remove_key("p1"), 1);
        assert!(!batcher.contains("p1"));
        assert_eq!(batcher.remove_key("ghost"), 0);
        assert_eq!(batcher.remove_key("p2"), 1);
        assert_eq!(batcher.age(), Duration::ZERO);
    }

    #[test]
    fn shutdown_flush_of_empty_batcher_is_none() {
        let mut batcher: HybridBatcher<QueueSave> = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.force_flush_with_reason(FlushReason::Shutdown).is_none());
    }
}
