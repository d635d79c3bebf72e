// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': expected checksum {expected}, got {actual}")]
    Corruption {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("Version conflict for '{key}': expected {expected}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// One versioned row in the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    /// Monotonic version; the first persisted version is 1
    pub version: u64,
    /// JSON document
    pub body: String,
    pub updated_at: i64,
}

/// Durable system of record with compare-and-set writes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError>;

    /// Write `record` only if the stored version equals `expected_version`.
    ///
    /// `expected_version == 0` means the record must not exist yet. Any
    /// mismatch yields [`StorageError::VersionConflict`] and leaves the
    /// stored record untouched.
    async fn put_if_version(
        &self,
        table: &str,
        record: &StoredRecord,
        expected_version: u64,
    ) -> Result<(), StorageError>;

    /// Remove a record. Deleting a missing key is not an error.
    async fn delete(&self, table: &str, key: &str) -> Result<(), StorageError>;

    /// List keys in a table, paginated. Used by integrity sweeps.
    async fn scan_keys(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Shared remote key/value cache with per-entry TTL.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn ping(&self) -> Result<(), StorageError>;
}
