// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the durable record store.
//!
//! One physical table holds every logical table, keyed by
//! `(table_name, record_key)`:
//!
//! ```sql
//! CREATE TABLE task_records (
//!   table_name VARCHAR(64)  NOT NULL,
//!   record_key VARCHAR(191) NOT NULL,
//!   version    BIGINT       NOT NULL,
//!   body       LONGTEXT     NOT NULL,  -- JSON document
//!   updated_at BIGINT       NOT NULL,
//!   PRIMARY KEY (table_name, record_key)
//! )
//! ```
//!
//! ## Compare-and-set
//!
//! Updates are a single conditional statement,
//! `UPDATE ... WHERE version = :expected`, so two writers holding the same
//! version cannot both succeed. Zero rows affected means a conflict (or a
//! missing row), and the current version is read back for the error.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver hands MySQL LONGTEXT back as bytes, so text columns are
//! read as `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;
use super::traits::{RecordStore, StorageError, StoredRecord};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema if needed.
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// SQLite WAL mode lets readers proceed during writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS task_records (
                table_name TEXT NOT NULL,
                record_key TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, record_key)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS task_records (
                table_name VARCHAR(64) NOT NULL,
                record_key VARCHAR(191) NOT NULL,
                version BIGINT NOT NULL,
                body LONGTEXT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (table_name, record_key),
                INDEX idx_updated_at (updated_at)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    async fn current_version(&self, table: &str, key: &str) -> Result<Option<u64>, StorageError> {
        let row = sqlx::query("SELECT version FROM task_records WHERE table_name = ? AND record_key = ?")
            .bind(table)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(row.and_then(|r| r.try_get::<i64, _>("version").ok()).map(|v| v as u64))
    }

    async fn insert_new(&self, table: &str, record: &StoredRecord) -> Result<(), StorageError> {
        let inserted = sqlx::query(
            "INSERT INTO task_records (table_name, record_key, version, body, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(table)
        .bind(&record.key)
        .bind(record.version as i64)
        .bind(&record.body)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) => match self.current_version(table, &record.key).await? {
                // Primary key collision: somebody created it first
                Some(actual) => Err(StorageError::VersionConflict {
                    key: record.key.clone(),
                    expected: 0,
                    actual: Some(actual),
                }),
                None => Err(StorageError::Backend(e.to_string())),
            },
        }
    }

    async fn update_versioned(&self, table: &str, record: &StoredRecord, expected: u64) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE task_records SET version = ?, body = ?, updated_at = ? WHERE table_name = ? AND record_key = ? AND version = ?",
        )
        .bind(record.version as i64)
        .bind(&record.body)
        .bind(record.updated_at)
        .bind(table)
        .bind(&record.key)
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let actual = self.current_version(table, &record.key).await?;
        debug!(table, key = %record.key, expected, ?actual, "Conditional update matched no rows");
        Err(StorageError::VersionConflict {
            key: record.key.clone(),
            expected,
            actual,
        })
    }
}

/// Read a text column that the `Any` driver may surface as bytes.
fn text_column(row: &sqlx::any::AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        retry("sql_get", &RetryConfig::query(), || async {
            let row = sqlx::query(
                "SELECT version, body, updated_at FROM task_records WHERE table_name = ? AND record_key = ?",
            )
            .bind(table)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            match row {
                Some(row) => {
                    let version: i64 = row
                        .try_get("version")
                        .map_err(|e| StorageError::Backend(e.to_string()))?;
                    let updated_at: i64 = row.try_get("updated_at").unwrap_or(0);
                    let body = text_column(&row, "body")
                        .ok_or_else(|| StorageError::Serialization(format!("unreadable body for '{}'", key)))?;
                    Ok(Some(StoredRecord {
                        key: key.to_string(),
                        version: version as u64,
                        body,
                        updated_at,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_if_version(
        &self,
        table: &str,
        record: &StoredRecord,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        retry_if("sql_put_if_version", &RetryConfig::query(), StorageError::is_transient, || async {
            if expected_version == 0 {
                self.insert_new(table, record).await
            } else {
                self.update_versioned(table, record, expected_version).await
            }
        })
        .await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        retry("sql_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM task_records WHERE table_name = ? AND record_key = ?")
                .bind(table)
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn scan_keys(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT record_key FROM task_records WHERE table_name = ? ORDER BY record_key LIMIT ? OFFSET ?",
        )
        .bind(table)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.iter().filter_map(|row| text_column(row, "record_key")).collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
