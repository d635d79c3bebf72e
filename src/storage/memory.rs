// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use super::traits::{RecordStore, RemoteCache, StorageError, StoredRecord};

/// Record store held entirely in memory. Used when no SQL backend is
/// configured and throughout the test suite.
pub struct InMemoryStore {
    data: DashMap<(String, String), StoredRecord>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current record count across all tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Overwrite a record without a version check (test fixtures, corruption drills).
    pub fn insert_raw(&self, table: &str, record: StoredRecord) {
        self.data.insert((table.to_string(), record.key.clone()), record);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self
            .data
            .get(&(table.to_string(), key.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn put_if_version(
        &self,
        table: &str,
        record: &StoredRecord,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        // The entry guard holds the shard lock, so check-and-write is atomic
        match self.data.entry((table.to_string(), record.key.clone())) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().version;
                if actual != expected_version {
                    return Err(StorageError::VersionConflict {
                        key: record.key.clone(),
                        expected: expected_version,
                        actual: Some(actual),
                    });
                }
                occupied.insert(record.clone());
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StorageError::VersionConflict {
                        key: record.key.clone(),
                        expected: expected_version,
                        actual: None,
                    });
                }
                vacant.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        self.data.remove(&(table.to_string(), key.to_string()));
        Ok(())
    }

    async fn scan_keys(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|r| r.key().0 == table)
            .map(|r| r.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys.into_iter().skip(offset as usize).take(limit).collect())
    }
}

/// In-process stand-in for the remote cache, honoring TTLs.
pub struct InMemoryCache {
    data: DashMap<String, (String, Instant)>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let expired = match self.data.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.data
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
