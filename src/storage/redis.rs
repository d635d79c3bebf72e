// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the remote cache tier.
//!
//! Values are JSON strings written with `SET key value EX ttl`, so Redis
//! expires entries on its own. Keys follow the cache's naming scheme:
//!
//! ```text
//! {prefix}queue:{player_id}
//! {prefix}progress:{player_id}:{task_id}
//! {prefix}freq:{name}
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use super::traits::{RemoteCache, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "game:" → "game:queue.p1")
    prefix: String,
}

impl RedisCache {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use task_queue_engine::storage::redis::RedisCache;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCache::with_prefix("redis://localhost", Some("game:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Startup config: fast-fail on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[inline]
fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

/// Redis rejects `EX 0`; sub-second TTLs round up to one second.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let prefixed_key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::cache(), || {
            let mut conn = conn.clone();
            let key = prefixed_key.clone();
            async move {
                let data: Option<String> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed_key = self.prefixed_key(key);
        let seconds = ttl_seconds(ttl);

        retry("redis_set", &RetryConfig::cache(), || {
            let mut conn = conn.clone();
            let key = prefixed_key.clone();
            async move {
                let _: () = conn.set_ex(&key, value, seconds).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed_key = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::cache(), || {
            let mut conn = conn.clone();
            let key = prefixed_key.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("unexpected PING reply: {}", pong)))
        }
    }
}
