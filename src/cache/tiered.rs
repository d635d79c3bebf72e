// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier cache: remote first, local on failure.
//!
//! ```text
//!            ┌──────────────────────────┐
//!  read ────►│ remote (circuit-guarded) │── error / open / unset ──┐
//!            └──────────────────────────┘                          ▼
//!                                                      ┌─────────────────┐
//!                                                      │ local (DashMap) │
//!                                                      └─────────────────┘
//! ```
//!
//! Cache failures never reach callers: a broken remote tier degrades to the
//! local tier, and an undecodable value is a miss. A local entry exists
//! only while its latest write failed to reach the remote tier, so local
//! entries shadow remote ones on read.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::local::LocalCache;
use super::pressure::PressureLevel;
use crate::config::TaskEngineConfig;
use crate::queue::TaskQueue;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::storage::traits::{RemoteCache, StorageError};
use crate::task::TaskProgress;

/// Data classes, each with its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    /// Resident queue state
    ActiveQueue,
    /// Derived progress projections; shortest lived
    TaskProgress,
    /// Aggregates such as player statistics; longest lived
    FrequentData,
}

impl CacheClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveQueue => "active_queue",
            Self::TaskProgress => "task_progress",
            Self::FrequentData => "frequent_data",
        }
    }
}

#[must_use]
pub fn queue_key(player_id: &str) -> String {
    format!("queue:{}", player_id)
}

#[must_use]
pub fn progress_key(player_id: &str, task_id: &str) -> String {
    format!("progress:{}:{}", player_id, task_id)
}

#[must_use]
pub fn frequent_key(name: &str) -> String {
    format!("freq:{}", name)
}

/// Per-class TTLs.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub active_queue: Duration,
    pub task_progress: Duration,
    pub frequent_data: Duration,
}

impl CacheTtls {
    #[must_use]
    pub fn from_config(config: &TaskEngineConfig) -> Self {
        Self {
            active_queue: Duration::from_secs(config.queue_state_ttl_secs),
            task_progress: Duration::from_secs(config.task_progress_ttl_secs),
            frequent_data: Duration::from_secs(config.frequent_data_ttl_secs),
        }
    }

    #[must_use]
    pub fn for_class(&self, class: CacheClass) -> Duration {
        match class {
            CacheClass::ActiveQueue => self.active_queue,
            CacheClass::TaskProgress => self.task_progress,
            CacheClass::FrequentData => self.frequent_data,
        }
    }
}

/// Hit/miss counters for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCounters {
    pub hits: u64,
    pub misses: u64,
}

/// Snapshot returned by [`TieredCache::stats`].
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub remote_errors: u64,
    pub local_entries: usize,
    pub local_bytes: usize,
    pub remote_configured: bool,
    pub remote_available: bool,
    pub per_key: HashMap<String, KeyCounters>,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pressure: PressureLevel,
    pub expired: usize,
    pub evicted: usize,
    pub aggressive_removed: usize,
}

pub struct TieredCache {
    remote: RwLock<Option<Arc<dyn RemoteCache>>>,
    circuit: CircuitBreaker,
    local: LocalCache,
    ttls: CacheTtls,
    pressure_threshold: f64,
    key_counters: DashMap<String, KeyCounters>,
    hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
}

impl TieredCache {
    /// Local-only cache; attach a remote tier later with [`Self::attach_remote`].
    #[must_use]
    pub fn new(config: &TaskEngineConfig) -> Self {
        Self {
            remote: RwLock::new(None),
            circuit: CircuitBreaker::new("remote_cache", CircuitConfig::remote_cache()),
            local: LocalCache::new(config.local_cache_max_entries, config.local_cache_max_bytes),
            ttls: CacheTtls::from_config(config),
            pressure_threshold: config.memory_pressure_threshold,
            key_counters: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_remote(config: &TaskEngineConfig, remote: Arc<dyn RemoteCache>) -> Self {
        let cache = Self::new(config);
        cache.attach_remote(remote);
        cache
    }

    pub fn attach_remote(&self, remote: Arc<dyn RemoteCache>) {
        *self.remote.write() = Some(remote);
    }

    /// Drop the remote handle (shutdown). Later calls use the local tier only.
    pub fn release_remote(&self) {
        if self.remote.write().take().is_some() {
            info!("Remote cache connection released");
        }
    }

    fn remote(&self) -> Option<Arc<dyn RemoteCache>> {
        self.remote.read().clone()
    }

    #[must_use]
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    fn note_remote_failure(&self, op: &str, key: &str, err: &CircuitError<StorageError>) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_fallback(op);
        match err {
            CircuitError::Rejected => debug!(key, op, "Remote cache circuit open, using local tier"),
            CircuitError::Inner(e) => warn!(key, op, error = %e, "Remote cache failed, using local tier"),
        }
    }

    fn record(&self, class: CacheClass, key: &str, hit: bool) {
        let mut counters = self.key_counters.entry(key.to_string()).or_default();
        if hit {
            counters.hits += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses += 1;
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        crate::metrics::record_cache_access(class.as_str(), if hit { "hit" } else { "miss" });
    }

    /// Raw read: remote first, local on failure or shadowing.
    pub async fn get_raw(&self, class: CacheClass, key: &str) -> Option<String> {
        let value = match self.remote() {
            Some(remote) => match self.circuit.call(|| remote.get(key)).await {
                Ok(remote_value) => self.local.get(key).or(remote_value),
                Err(e) => {
                    self.note_remote_failure("get", key, &e);
                    self.local.get(key)
                }
            },
            None => self.local.get(key),
        };
        self.record(class, key, value.is_some());
        value
    }

    /// Raw write with the class TTL.
    pub async fn set_raw(&self, class: CacheClass, key: &str, value: String) {
        let ttl = self.ttls.for_class(class);
        match self.remote() {
            Some(remote) => match self.circuit.call(|| remote.set(key, &value, ttl)).await {
                Ok(()) => {
                    // Remote now holds the newest value
                    self.local.remove(key);
                }
                Err(e) => {
                    self.note_remote_failure("set", key, &e);
                    self.local.set(key, value, ttl);
                }
            },
            None => self.local.set(key, value, ttl),
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.local.remove(key);
        if let Some(remote) = self.remote() {
            if let Err(e) = self.circuit.call(|| remote.delete(key)).await {
                self.note_remote_failure("delete", key, &e);
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, class: CacheClass, key: &str) -> Option<T> {
        let raw = self.get_raw(class, key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(key).await;
                None
            }
        }
    }

    async fn set_json<T: Serialize>(&self, class: CacheClass, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_raw(class, key, raw).await,
            Err(e) => warn!(key, error = %e, "Skipping cache write for unserializable value"),
        }
    }

    pub async fn get_cached_queue_state(&self, player_id: &str) -> Option<TaskQueue> {
        self.get_json(CacheClass::ActiveQueue, &queue_key(player_id)).await
    }

    /// Cache `queue` as the player's live state. A queue with unsaved changes
    /// is cached with its checksum recomputed, so readers can tell a
    /// corrupted entry from a legitimately newer one.
    pub async fn cache_active_queue_state(&self, queue: &TaskQueue) {
        let key = queue_key(&queue.player_id);
        if queue.verify_checksum() {
            self.set_json(CacheClass::ActiveQueue, &key, queue).await;
        } else {
            let mut sealed = queue.clone();
            sealed.checksum = sealed.compute_checksum();
            self.set_json(CacheClass::ActiveQueue, &key, &sealed).await;
        }
    }

    pub async fn invalidate_queue(&self, player_id: &str) {
        self.invalidate(&queue_key(player_id)).await;
    }

    pub async fn get_cached_task_progress(&self, player_id: &str, task_id: &str) -> Option<TaskProgress> {
        self.get_json(CacheClass::TaskProgress, &progress_key(player_id, task_id))
            .await
    }

    pub async fn cache_task_progress(&self, player_id: &str, progress: &TaskProgress) {
        self.set_json(
            CacheClass::TaskProgress,
            &progress_key(player_id, &progress.task_id),
            progress,
        )
        .await;
    }

    pub async fn get_cached_frequent_data<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get_json(CacheClass::FrequentData, &frequent_key(name)).await
    }

    pub async fn cache_frequent_data<T: Serialize>(&self, name: &str, value: &T) {
        self.set_json(CacheClass::FrequentData, &frequent_key(name), value)
            .await;
    }

    /// Sweep the local tier; under critical pressure, rebuild it at half size.
    pub fn maintain(&self) -> MaintenanceReport {
        let pressure = self.local.pressure_level(self.pressure_threshold);
        let sweep = self.local.sweep();
        let aggressive_removed = if self.local.pressure_level(self.pressure_threshold).requires_aggressive_cleanup() {
            let removed = self.local.aggressive_cleanup();
            warn!(
                removed,
                ratio = self.local.memory_ratio(),
                "Local cache under memory pressure, aggressive cleanup ran"
            );
            crate::metrics::record_cache_cleanup("aggressive", removed);
            removed
        } else {
            0
        };

        if sweep.expired + sweep.evicted > 0 {
            debug!(expired = sweep.expired, evicted = sweep.evicted, "Local cache sweep");
            crate::metrics::record_cache_cleanup("sweep", sweep.expired + sweep.evicted);
        }
        crate::metrics::set_local_cache_entries(self.local.len());
        crate::metrics::set_local_cache_bytes(self.local.total_bytes());
        crate::metrics::set_memory_pressure(self.local.memory_ratio());

        MaintenanceReport {
            pressure,
            expired: sweep.expired,
            evicted: sweep.evicted,
            aggressive_removed,
        }
    }

    #[must_use]
    pub fn key_counters(&self, key: &str) -> KeyCounters {
        self.key_counters.get(key).map(|c| *c).unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let remote_configured = self.remote.read().is_some();
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            local_entries: self.local.len(),
            local_bytes: self.local.total_bytes(),
            remote_configured,
            remote_available: remote_configured && self.circuit.state() != CircuitState::Open,
            per_key: self
                .key_counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryCache;
    use crate::task::{Task, TaskType};
    use async_trait::async_trait;

    /// Remote cache that always fails.
    struct DownCache;

    #[async_trait]
    impl RemoteCache for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
    }

    fn config() -> TaskEngineConfig {
        TaskEngineConfig::default()
    }

    #[tokio::test]
    async fn test_local_only_round_trip() {
        let cache = TieredCache::new(&config());
        let mut queue = TaskQueue::new("p1");
        queue.enqueue(Task::new("a", TaskType::Combat, "Fight", 1_000), 0).unwrap();

        assert!(cache.get_cached_queue_state("p1").await.is_none());
        cache.cache_active_queue_state(&queue).await;
        let cached = cache.get_cached_queue_state("p1").await.unwrap();
        assert!(cached.verify_checksum());
        assert_eq!(cached.queued_tasks, queue.queued_tasks);

        let counters = cache.key_counters("queue:p1");
        assert_eq!(counters, KeyCounters { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn test_remote_used_when_healthy() {
        let remote = Arc::new(InMemoryCache::new());
        let cache = TieredCache::with_remote(&config(), remote.clone());

        cache.cache_frequent_data("stats:p1", &42u64).await;
        assert_eq!(remote.len(), 1);
        assert!(cache.local().is_empty());
        assert_eq!(cache.get_cached_frequent_data::<u64>("stats:p1").await, Some(42));
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_transparently() {
        let cache = TieredCache::with_remote(&config(), Arc::new(DownCache));
        let progress = TaskProgress {
            task_id: "t1".into(),
            progress: 0.5,
            time_remaining_ms: 500,
            is_complete: false,
        };

        cache.cache_task_progress("p1", &progress).await;
        assert_eq!(cache.get_cached_task_progress("p1", "t1").await, Some(progress));

        let stats = cache.stats();
        assert!(stats.remote_configured);
        assert!(stats.remote_errors >= 2);
        assert_eq!(stats.local_entries, 1);
    }

    #[tokio::test]
    async fn test_local_entry_shadows_stale_remote() {
        let remote = Arc::new(InMemoryCache::new());
        remote.set("freq:k", "\"old\"", Duration::from_secs(60)).await.unwrap();
        let cache = TieredCache::with_remote(&config(), remote);
        cache.local().set("freq:k", "\"new\"".into(), Duration::from_secs(60));

        assert_eq!(cache.get_cached_frequent_data::<String>("k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let cache = TieredCache::new(&config());
        cache.set_raw(CacheClass::ActiveQueue, "queue:p1", "not json".into()).await;
        assert!(cache.get_cached_queue_state("p1").await.is_none());
        assert!(cache.local().is_empty());
    }

    #[tokio::test]
    async fn test_release_remote_reverts_to_local() {
        let remote = Arc::new(InMemoryCache::new());
        let cache = TieredCache::with_remote(&config(), remote.clone());
        cache.release_remote();

        cache.cache_frequent_data("x", &1u8).await;
        assert!(remote.is_empty());
        assert_eq!(cache.local().len(), 1);
        assert!(!cache.stats().remote_configured);
    }

    #[tokio::test]
    async fn test_maintain_runs_aggressive_cleanup_under_pressure() {
        let config = TaskEngineConfig {
            local_cache_max_bytes: 1_000,
            ..TaskEngineConfig::default()
        };
        let cache = TieredCache::new(&config);
        for i in 0..10 {
            cache.local().set(&format!("k{}", i), "x".repeat(95), Duration::from_secs(60));
        }

        let report = cache.maintain();
        assert_eq!(report.pressure, PressureLevel::Critical);
        assert_eq!(report.aggressive_removed, 5);
        assert_eq!(cache.local().len(), 5);
    }

    #[test]
    fn test_ttls_follow_config() {
        let ttls = CacheTtls::from_config(&config());
        assert_eq!(ttls.for_class(CacheClass::TaskProgress), Duration::from_secs(60));
        assert_eq!(ttls.for_class(CacheClass::ActiveQueue), Duration::from_secs(300));
        assert_eq!(ttls.for_class(CacheClass::FrequentData), Duration::from_secs(3600));
    }
}
