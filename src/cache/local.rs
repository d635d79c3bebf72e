// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache tier.
//!
//! Serves every read and write while the remote cache is unreachable.
//! Entries expire on their own TTL; a periodic [`LocalCache::sweep`] drops
//! expired entries and, over the entry ceiling, the least recently
//! accessed 20%. Under memory pressure [`LocalCache::aggressive_cleanup`]
//! keeps only the most recently accessed half.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::pressure::PressureLevel;

/// Share of entries a sweep evicts once the entry ceiling is exceeded.
pub const LRU_EVICTION_PERCENT: usize = 20;

/// Cache entry plus the metadata eviction decisions use.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub value: String,
    pub timestamp: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_accessed: Instant,
    /// Logical access clock; breaks ties that `Instant` cannot
    access_seq: u64,
    pub size_bytes: usize,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.timestamp) >= self.ttl
    }
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

pub struct LocalCache {
    entries: DashMap<String, LocalEntry>,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: AtomicUsize,
    clock: AtomicU64,
}

impl LocalCache {
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            total_bytes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read a live entry, recording the access. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if !entry.is_expired(now) {
                entry.access_count = entry.access_count.saturating_add(1);
                entry.last_accessed = now;
                entry.access_seq = self.tick();
                return Some(entry.value.clone());
            }
        }
        // Shard guard released above; safe to remove
        self.remove(key);
        None
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        let now = Instant::now();
        let size_bytes = key.len() + value.len();
        let entry = LocalEntry {
            value,
            timestamp: now,
            ttl,
            access_count: 0,
            last_accessed: now,
            access_seq: self.tick(),
            size_bytes,
        };
        self.total_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, old)) => {
                self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Byte usage over the byte budget.
    #[must_use]
    pub fn memory_ratio(&self) -> f64 {
        self.total_bytes() as f64 / self.max_bytes as f64
    }

    #[must_use]
    pub fn pressure_level(&self, threshold: f64) -> PressureLevel {
        PressureLevel::from_ratio(self.memory_ratio(), threshold)
    }

    /// Keys ordered least recently accessed first.
    fn keys_by_recency(&self) -> Vec<String> {
        let mut keyed: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|e| (e.access_seq, e.key().clone()))
            .collect();
        keyed.sort_unstable_by_key(|(seq, _)| *seq);
        keyed.into_iter().map(|(_, k)| k).collect()
    }

    /// Drop expired entries, then the least recently accessed
    /// [`LRU_EVICTION_PERCENT`] if still over the entry ceiling.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        let mut report = SweepReport::default();
        for key in &expired_keys {
            if self.remove(key) {
                report.expired += 1;
            }
        }

        let len = self.entries.len();
        if len > self.max_entries {
            let to_evict = (len * LRU_EVICTION_PERCENT).div_ceil(100);
            for key in self.keys_by_recency().into_iter().take(to_evict) {
                if self.remove(&key) {
                    report.evicted += 1;
                }
            }
        }
        report
    }

    /// Rebuild keeping only the most recently accessed half. Returns removed count.
    pub fn aggressive_cleanup(&self) -> usize {
        let ordered = self.keys_by_recency();
        let drop_count = ordered.len() - ordered.len() / 2;
        let mut removed = 0;
        for key in ordered.into_iter().take(drop_count) {
            if self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    /// Metadata snapshot for one key (diagnostics and tests).
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<LocalEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn test_set_get_tracks_access() {
        let cache = LocalCache::new(10, 1_000);
        cache.set("a", "alpha".into(), LONG);

        assert_eq!(cache.get("a").as_deref(), Some("alpha"));
        assert_eq!(cache.get("a").as_deref(), Some("alpha"));
        assert_eq!(cache.entry("a").unwrap().access_count, 2);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = LocalCache::new(10, 1_000);
        cache.set("a", "alpha".into(), Duration::ZERO);
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_overwrite_keeps_byte_accounting() {
        let cache = LocalCache::new(10, 1_000);
        cache.set("k", "12345".into(), LONG);
        cache.set("k", "12".into(), LONG);
        assert_eq!(cache.total_bytes(), 3);
        cache.remove("k");
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_sweep_evicts_expired_and_lru_fifth() {
        let cache = LocalCache::new(10, 100_000);
        cache.set("stale", "x".into(), Duration::ZERO);
        for i in 0..15 {
            cache.set(&format!("k{:02}", i), "v".into(), LONG);
        }
        // Touch the oldest so it survives
        cache.get("k00");

        let report = cache.sweep();
        assert_eq!(report.expired, 1);
        // 15 entries over a ceiling of 10 → evict ceil(15 * 0.2) = 3
        assert_eq!(report.evicted, 3);
        assert_eq!(cache.len(), 12);
        assert!(cache.contains("k00"));
        assert!(!cache.contains("k01"));
        assert!(!cache.contains("k03"));
        assert!(cache.contains("k04"));
    }

    #[test]
    fn test_sweep_evicts_same_fifth_under_elevated_pressure() {
        // 15 entries of 4 bytes against an 80 byte budget: ratio 0.75
        let cache = LocalCache::new(10, 80);
        for i in 0..15 {
            cache.set(&format!("k{:02}", i), "v".into(), LONG);
        }
        assert_eq!(cache.pressure_level(0.85), PressureLevel::Elevated);

        let report = cache.sweep();
        assert_eq!(report.evicted, 3);
        assert_eq!(cache.len(), 12);
        assert!(!cache.contains("k02"));
        assert!(cache.contains("k03"));
    }

    #[test]
    fn test_sweep_under_ceiling_only_drops_expired() {
        let cache = LocalCache::new(10, 100_000);
        for i in 0..5 {
            cache.set(&format!("k{}", i), "v".into(), LONG);
        }
        assert_eq!(cache.sweep(), SweepReport::default());
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_aggressive_cleanup_keeps_recent_half() {
        let cache = LocalCache::new(100, 100_000);
        for i in 0..10 {
            cache.set(&format!("k{}", i), "v".into(), LONG);
        }
        cache.get("k0");

        let removed = cache.aggressive_cleanup();
        assert_eq!(removed, 5);
        assert_eq!(cache.len(), 5);
        assert!(cache.contains("k0"));
        assert!(cache.contains("k9"));
        assert!(!cache.contains("k1"));
    }

    #[test]
    fn test_memory_ratio_and_pressure() {
        let cache = LocalCache::new(100, 100);
        cache.set("key", "x".repeat(87), LONG);
        assert!(cache.memory_ratio() >= 0.9);
        assert_eq!(cache.pressure_level(0.85), PressureLevel::Critical);
    }
}
