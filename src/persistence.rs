// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue persistence with optimistic concurrency.
//!
//! Every save is a compare-and-set on the queue's version: the stored
//! record must still carry the version the caller last saw. A mismatch is
//! surfaced as [`QueueError::ConcurrencyConflict`] and nothing is written;
//! the caller reloads and retries.
//!
//! Checksums are verified on every load. A record whose content no longer
//! matches its checksum is reported as [`StorageError::Corruption`] rather
//! than handed to the engine.

use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use crate::metrics::LatencyTimer;
use crate::pool::ConnectionPool;
use crate::queue::{QueueError, QueueSnapshot, TaskQueue};
use crate::storage::traits::{StorageError, StoredRecord};
use crate::task::epoch_millis;

/// Outcome of an integrity check against a resident queue and its stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub player_id: String,
    pub violations: Vec<String>,
    pub stored_version: Option<u64>,
    /// `None` when no record is stored yet
    pub stored_checksum_valid: Option<bool>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct PersistenceService {
    pool: Arc<ConnectionPool>,
    table: String,
}

impl PersistenceService {
    pub fn new(pool: Arc<ConnectionPool>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Decode a stored record, rejecting content that fails its checksum.
    fn decode(&self, player_id: &str, record: &StoredRecord) -> Result<TaskQueue, StorageError> {
        let queue: TaskQueue = serde_json::from_str(&record.body)?;
        let actual = queue.compute_checksum();
        if actual != queue.checksum || queue.version != record.version || queue.player_id != player_id {
            crate::metrics::record_corruption(&self.table);
            error!(
                player_id,
                stored_version = record.version,
                body_version = queue.version,
                "Stored queue failed integrity check"
            );
            return Err(StorageError::Corruption {
                key: player_id.to_string(),
                expected: queue.checksum,
                actual,
            });
        }
        Ok(queue)
    }

    /// Load a player's queue. A missing record is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn load_queue(&self, player_id: &str) -> Result<Option<TaskQueue>, QueueError> {
        let _timer = LatencyTimer::new("store", "load");
        let client = self.pool.acquire().await?;
        let record = match client.get(&self.table, player_id).await {
            Ok(Some(record)) => record,
            Ok(None) | Err(StorageError::NotFound) => {
                crate::metrics::record_operation("store", "load", "miss");
                return Ok(None);
            }
            Err(e) => {
                crate::metrics::record_operation("store", "load", "error");
                return Err(e.into());
            }
        };
        let queue = self.decode(player_id, &record)?;
        crate::metrics::record_operation("store", "load", "hit");
        Ok(Some(queue))
    }

    /// Conditionally write `queue`, requiring the stored version to equal
    /// `queue.version`. On success the queue's version is incremented, its
    /// checksum recomputed, and `last_synced` stamped. On failure the queue
    /// is left untouched.
    #[instrument(skip(self, queue), fields(player_id = %queue.player_id, version = queue.version))]
    pub async fn save_queue_with_atomic_update(&self, queue: &mut TaskQueue) -> Result<u64, QueueError> {
        let _timer = LatencyTimer::new("store", "save");
        let expected = queue.version;
        let now = epoch_millis();

        let mut candidate = queue.clone();
        candidate.version = expected + 1;
        candidate.last_synced = now;
        candidate.checksum = candidate.compute_checksum();

        let record = StoredRecord {
            key: candidate.player_id.clone(),
            version: candidate.version,
            body: serde_json::to_string(&candidate).map_err(StorageError::from)?,
            updated_at: now,
        };

        let client = self.pool.acquire().await?;
        match client.put_if_version(&self.table, &record, expected).await {
            Ok(()) => {
                queue.version = candidate.version;
                queue.checksum = candidate.checksum;
                queue.last_synced = now;
                crate::metrics::record_operation("store", "save", "success");
                debug!(new_version = queue.version, "Queue persisted");
                Ok(queue.version)
            }
            Err(e @ StorageError::VersionConflict { .. }) => {
                crate::metrics::record_operation("store", "save", "conflict");
                warn!(error = %e, "Stale queue write rejected");
                Err(e.into())
            }
            Err(e) => {
                crate::metrics::record_operation("store", "save", "error");
                Err(e.into())
            }
        }
    }

    /// Append a snapshot of the queue's current state to its bounded history.
    pub fn create_state_snapshot(&self, queue: &mut TaskQueue) -> QueueSnapshot {
        let snapshot = queue.snapshot(epoch_millis());
        queue.push_snapshot(snapshot.clone());
        snapshot
    }

    /// Check a resident queue's structure and the stored record behind it.
    #[instrument(skip(self, queue), fields(player_id = %queue.player_id))]
    pub async fn validate_queue_integrity(&self, queue: &TaskQueue) -> Result<IntegrityReport, QueueError> {
        let mut report = IntegrityReport {
            player_id: queue.player_id.clone(),
            violations: queue.invariant_violations(),
            stored_version: None,
            stored_checksum_valid: None,
        };

        let client = self.pool.acquire().await?;
        let record = match client.get(&self.table, &queue.player_id).await {
            Ok(record) => record,
            Err(StorageError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        drop(client);

        if let Some(record) = record {
            report.stored_version = Some(record.version);
            match self.decode(&queue.player_id, &record) {
                Ok(_) => report.stored_checksum_valid = Some(true),
                Err(e) => {
                    report.stored_checksum_valid = Some(false);
                    report.violations.push(e.to_string());
                }
            }
            if record.version > queue.version {
                report.violations.push(format!(
                    "stored version {} is ahead of resident version {}",
                    record.version, queue.version
                ));
            }
        }
        Ok(report)
    }

    /// Remove a player's record entirely.
    pub async fn delete_queue(&self, player_id: &str) -> Result<(), QueueError> {
        let client = self.pool.acquire().await?;
        client.delete(&self.table, player_id).await?;
        crate::metrics::record_operation("store", "delete", "success");
        Ok(())
    }

    /// Page through stored player ids.
    pub async fn list_player_ids(&self, offset: u64, limit: usize) -> Result<Vec<String>, QueueError> {
        let client = self.pool.acquire().await?;
        Ok(client.scan_keys(&self.table, offset, limit).await?)
    }
}
