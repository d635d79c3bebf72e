// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: start, run loop, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{ServiceState, ShutdownReport, TaskQueueService};
use crate::batching::FlushReason;
use crate::config::TaskEngineConfig;
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use crate::storage::redis::RedisCache;
use crate::storage::traits::{RemoteCache, StorageError};

impl TaskQueueService {
    /// Connect backends.
    ///
    /// 1. Open the pool's floor of store handles (fatal on failure)
    /// 2. Attach the remote cache (optional; failure leaves the local tier in charge)
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), StorageError> {
        let startup_start = Instant::now();
        info!("Starting task queue service");
        self.set_state(ServiceState::Starting);

        let phase_start = Instant::now();
        let warmed = retry_if(
            "pool_warm_up",
            &RetryConfig::startup(),
            StorageError::is_transient,
            || self.pool.warm_up(),
        )
        .await;
        match warmed {
            Ok(handles) => {
                info!(handles, "Store connections ready");
                crate::metrics::record_startup_phase("pool", phase_start.elapsed());
            }
            Err(e) => {
                error!(error = %e, "Backing store unavailable, aborting start");
                self.set_state(ServiceState::Created);
                return Err(e);
            }
        }

        let phase_start = Instant::now();
        if let Some(remote) = self.connect_remote_cache().await {
            self.core.cache().attach_remote(remote);
            crate::metrics::record_startup_phase("remote_cache", phase_start.elapsed());
        }

        self.set_state(ServiceState::Ready);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Task queue service ready");
        Ok(())
    }

    async fn connect_remote_cache(&self) -> Option<Arc<dyn RemoteCache>> {
        if let Some(remote) = &self.remote_cache {
            return Some(remote.clone());
        }
        let (url, prefix) = {
            let config = self.config.read();
            (config.redis_url.clone()?, config.redis_prefix.clone())
        };
        match retry("redis_connect", &RetryConfig::cache(), || {
            RedisCache::with_prefix(&url, prefix.as_deref())
        })
        .await
        {
            Ok(cache) => {
                info!("Remote cache connected");
                Some(Arc::new(cache))
            }
            Err(e) => {
                warn!(error = %e, "Remote cache unavailable, running on local cache only");
                None
            }
        }
    }

    /// Drive background maintenance until [`shutdown`](Self::shutdown).
    ///
    /// Interval lengths are read once when the loop starts; config updates
    /// change the debounce delay and milestone epsilon.
    pub async fn run(&self) {
        self.set_state(ServiceState::Running);
        info!("Task queue service running");

        let (batch_every, cache_every, pool_every, snapshot_every) = {
            let config = self.config.read();
            (
                Duration::from_millis((config.batch_timeout_ms / 2).max(50)),
                Duration::from_secs(config.cache_maintenance_secs.max(1)),
                Duration::from_secs(config.pool_maintenance_secs.max(1)),
                Duration::from_secs(config.snapshot_interval_secs.max(1)),
            )
        };
        let mut batch_sweep = tokio::time::interval(batch_every);
        let mut cache_sweep = tokio::time::interval(cache_every);
        let mut pool_sweep = tokio::time::interval(pool_every);
        let mut integrity_sweep = tokio::time::interval(snapshot_every);

        let mut config_rx = self.config_rx.lock().await;
        let mut config_open = true;

        loop {
            tokio::select! {
                changed = config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        debug!("Config channel closed");
                        config_open = false;
                        continue;
                    }
                    let new_config = config_rx.borrow_and_update().clone();
                    self.apply_config(new_config);
                }

                _ = batch_sweep.tick() => {
                    self.coalescer.flush_ready().await;
                }

                _ = cache_sweep.tick() => {
                    self.maintain_cache();
                }

                _ = pool_sweep.tick() => {
                    self.pool.maintain().await;
                }

                _ = integrity_sweep.tick() => {
                    self.integrity_sweep().await;
                }

                _ = self.shutdown_signal.notified() => {
                    break;
                }
            }
        }
        info!("Run loop stopped");
    }

    fn apply_config(&self, new_config: TaskEngineConfig) {
        self.debouncer
            .set_delay(Duration::from_millis(new_config.progress_debounce_ms));
        info!(
            progress_debounce_ms = new_config.progress_debounce_ms,
            milestone_epsilon = new_config.milestone_epsilon,
            "Config updated"
        );
        *self.config.write() = new_config;
    }

    fn maintain_cache(&self) {
        let report = self.core.cache().maintain();
        if report.expired + report.evicted + report.aggressive_removed > 0 {
            debug!(?report, "Cache maintenance");
        }
    }

    /// Snapshot and validate every resident queue. Failures are logged and
    /// counted; none are fatal.
    async fn integrity_sweep(&self) -> usize {
        let mut checked = 0;
        for player_id in self.core.resident_players() {
            match self.core.snapshot_and_validate(&player_id).await {
                Ok(Some(_)) => checked += 1,
                Ok(None) => {}
                Err(e) => warn!(player_id = %player_id, error = %e, "Integrity check could not run"),
            }
        }
        checked
    }

    /// One manual pass of every background sweep.
    pub async fn tick(&self) {
        self.coalescer.flush_ready().await;
        self.maintain_cache();
        self.pool.maintain().await;
        self.integrity_sweep().await;
    }

    /// Graceful shutdown, in order:
    ///
    /// 1. Cancel every debounce timer
    /// 2. Flush all pending batches
    /// 3. Persist every resident queue with unsaved changes
    /// 4. Release the remote cache and the store pool
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        if matches!(self.state(), ServiceState::ShuttingDown | ServiceState::Stopped) {
            return ShutdownReport::default();
        }
        let shutdown_start = Instant::now();
        info!("Initiating task queue service shutdown");
        self.set_state(ServiceState::ShuttingDown);
        self.shutdown_signal.notify_one();

        let mut report = ShutdownReport {
            debounce_cancelled: self.debouncer.cancel_all().await,
            ..Default::default()
        };
        report.batched_flushed = self.coalescer.flush_all(FlushReason::Shutdown).await;

        for player_id in self.core.resident_players() {
            match self.core.persist_if_dirty(&player_id, None).await {
                Ok(Some(_)) => report.queues_persisted += 1,
                Ok(None) => {}
                Err(e) => {
                    report.persist_failures += 1;
                    error!(player_id = %player_id, error = %e, "Queue could not be persisted on shutdown");
                }
            }
        }

        self.core.cache().release_remote();
        self.pool.close().await;

        self.set_state(ServiceState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!(?report, "Task queue service stopped");
        report
    }
}
