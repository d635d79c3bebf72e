// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for backend calls.
//!
//! Three budgets are used across the engine:
//!
//! - [`RetryConfig::startup()`] while `start()` connects the store and remote cache
//! - [`RetryConfig::query()`] around single record reads and versioned writes
//! - [`RetryConfig::cache()`] around remote cache calls, which have a local fallback
//!
//! ```
//! use task_queue_engine::RetryConfig;
//!
//! assert_eq!(RetryConfig::startup().attempts, Some(5));
//! assert_eq!(RetryConfig::cache().attempts, Some(2));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries including the first. `None` keeps trying.
    pub attempts: Option<usize>,
    pub first_backoff: Duration,
    pub backoff_cap: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Roughly five seconds of patience for a backend that is still coming up.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            attempts: Some(5),
            first_backoff: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    #[must_use]
    pub fn query() -> Self {
        Self {
            attempts: Some(3),
            first_backoff: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// One quick second try, then the tiered cache falls back to its local map.
    #[must_use]
    pub fn cache() -> Self {
        Self {
            attempts: Some(2),
            first_backoff: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            attempts: Some(3),
            first_backoff: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Delay that follows `current`, capped.
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.backoff_cap)
    }

    fn exhausted(&self, tried: usize) -> bool {
        self.attempts.is_some_and(|limit| tried >= limit)
    }
}

/// Retry `op` on any error until the attempt budget is spent.
pub async fn retry<F, Fut, T, E>(label: &str, config: &RetryConfig, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(label, config, |_| true, op).await
}

/// Like [`retry`], but errors failing `transient` are returned on first sight.
/// A version conflict on a queue save is the usual example.
pub async fn retry_if<F, Fut, T, E, P>(label: &str, config: &RetryConfig, transient: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = config.first_backoff;
    let mut tried = 0usize;

    loop {
        let err = match op().await {
            Ok(value) => {
                if tried > 0 {
                    info!(op = label, retries = tried, "Backend call recovered");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        tried += 1;
        if !transient(&err) || config.exhausted(tried) {
            return Err(err);
        }

        warn!(
            op = label,
            attempt = tried,
            limit = ?config.attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Backend call failed, backing off"
        );
        sleep(backoff).await;
        backoff = config.next_backoff(backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_success_returns_without_sleeping() {
        let got: Result<u64, StorageError> = retry("sql_get", &RetryConfig::test(), || async { Ok(7) }).await;
        assert_eq!(got.unwrap(), 7);
    }

    #[tokio::test]
    async fn flaky_store_recovers_within_budget() {
        let calls = AtomicUsize::new(0);

        let got: Result<&str, StorageError> = retry("sql_get", &RetryConfig::test(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(StorageError::Backend(format!("timeout #{n}")))
                } else {
                    Ok("row")
                }
            }
        })
        .await;

        assert_eq!(got.unwrap(), "row");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dead_store_gives_up_after_attempt_limit() {
        let calls = AtomicUsize::new(0);

        let got: Result<(), StorageError> = retry("sql_put", &RetryConfig::test(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Backend("down".into())) }
        })
        .await;

        assert!(got.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn version_conflict_is_not_retried() {
        let calls = AtomicUsize::new(0);

        let got: Result<(), StorageError> = retry_if(
            "sql_put_if_version",
            &RetryConfig::test(),
            StorageError::is_transient,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StorageError::VersionConflict {
                        key: "queue:p1".into(),
                        expected: 1,
                        actual: Some(2),
                    })
                }
            },
        )
        .await;

        assert!(matches!(got, Err(StorageError::VersionConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_then_caps() {
        let config = RetryConfig {
            attempts: Some(5),
            first_backoff: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            multiplier: 3.0,
        };

        let second = config.next_backoff(config.first_backoff);
        assert_eq!(second, Duration::from_secs(3));
        assert_eq!(config.next_backoff(second), Duration::from_secs(5));
    }
}
