// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task queue service.
//!
//! The [`TaskQueueService`] owns every resident player queue and ties
//! together the components underneath it:
//! - Two-tier cache (remote with local fallback) in front of storage
//! - Write coalescer for batched durability
//! - Per-player progress debouncer
//! - Persistence with version-checked saves over a connection pool
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use task_queue_engine::{TaskQueueService, TaskEngineConfig, ServiceState, Task, TaskType};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = TaskEngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let service = TaskQueueService::new(config, rx);
//! assert_eq!(service.state(), ServiceState::Created);
//!
//! service.start().await.expect("start failed");
//! let outcome = service
//!     .add_task("player-1", Task::new("t1", TaskType::Harvesting, "Chop wood", 30_000))
//!     .await
//!     .expect("add failed");
//! println!("{:?}", outcome);
//! service.shutdown().await;
//! # }
//! ```

mod api;
mod debounce;
mod flush;
mod lifecycle;
mod resident;
mod types;

pub use types::{
    is_milestone, AcceptAllTasks, BatchResult, PlayerStats, QueueOperation, QueueStatus, ServiceState,
    ShutdownReport, TaskValidator, WriteOutcome, MILESTONES,
};

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};

use crate::batching::{BatchFailure, CoalescerStats, WriteCoalescer};
use crate::cache::{CacheStats, TieredCache};
use crate::config::TaskEngineConfig;
use crate::persistence::PersistenceService;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats, SharedStoreConnector, SqlConnector, StoreConnector};
use crate::storage::memory::InMemoryStore;
use crate::storage::traits::RemoteCache;

use debounce::ProgressDebouncer;
use flush::{ProgressFlusher, QueueWriteExecutor};
use resident::QueueCore;

/// Collaborators injected in place of the config-selected defaults.
#[derive(Default)]
pub struct ServiceBackends {
    /// Backing store connector. Defaults to SQL when `sql_url` is set,
    /// otherwise a process-local in-memory store.
    pub connector: Option<Arc<dyn StoreConnector>>,
    /// Remote cache tier. Defaults to Redis when `redis_url` is set.
    pub remote_cache: Option<Arc<dyn RemoteCache>>,
    pub task_validator: Option<Arc<dyn TaskValidator>>,
}

/// Per-player task queue orchestration.
pub struct TaskQueueService {
    /// RwLock so run() can take &self while applying updates
    pub(super) config: RwLock<TaskEngineConfig>,
    pub(super) config_rx: Mutex<watch::Receiver<TaskEngineConfig>>,

    pub(super) state: watch::Sender<ServiceState>,
    pub(super) state_rx: watch::Receiver<ServiceState>,

    pub(super) core: Arc<QueueCore>,
    pub(super) pool: Arc<ConnectionPool>,
    pub(super) coalescer: WriteCoalescer,
    pub(super) debouncer: ProgressDebouncer,
    pub(super) validator: Arc<dyn TaskValidator>,
    /// Injected remote tier; attached in start()
    pub(super) remote_cache: Option<Arc<dyn RemoteCache>>,

    pub(super) shutdown_signal: Notify,
}

impl TaskQueueService {
    /// Create a service with backends chosen from `config`.
    pub fn new(config: TaskEngineConfig, config_rx: watch::Receiver<TaskEngineConfig>) -> Self {
        Self::with_backends(config, config_rx, ServiceBackends::default())
    }

    /// Create a service with injected collaborators.
    pub fn with_backends(
        config: TaskEngineConfig,
        config_rx: watch::Receiver<TaskEngineConfig>,
        backends: ServiceBackends,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);

        let connector: Arc<dyn StoreConnector> = match (backends.connector, &config.sql_url) {
            (Some(connector), _) => connector,
            (None, Some(url)) => Arc::new(SqlConnector::new(url.clone(), config.sql_max_connections)),
            (None, None) => Arc::new(SharedStoreConnector::new(Arc::new(InMemoryStore::new()))),
        };
        let pool = Arc::new(ConnectionPool::new(connector, PoolConfig::from(&config)));
        let cache = Arc::new(TieredCache::new(&config));
        let persistence = PersistenceService::new(pool.clone(), config.queue_table.clone());
        let core = Arc::new(QueueCore::new(persistence, cache, config.max_history_size));

        let coalescer = WriteCoalescer::from_config(&config, Arc::new(QueueWriteExecutor::new(core.clone())));
        let debouncer = ProgressDebouncer::new(
            Duration::from_millis(config.progress_debounce_ms),
            Arc::new(ProgressFlusher::new(core.clone(), coalescer.clone())),
        );

        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            core,
            pool,
            coalescer,
            debouncer,
            validator: backends.task_validator.unwrap_or_else(|| Arc::new(AcceptAllTasks)),
            remote_cache: backends.remote_cache,
            shutdown_signal: Notify::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Receiver for lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ServiceState::Ready | ServiceState::Running)
    }

    #[must_use]
    pub fn config(&self) -> TaskEngineConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        self.core.cache()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache().stats()
    }

    #[must_use]
    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }

    /// Drain per-operation failures from batched writes. Affected players
    /// can be reconciled with [`ensure_durable`](Self::ensure_durable).
    pub fn take_batch_failures(&self) -> Vec<BatchFailure> {
        self.coalescer.take_failures()
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    #[must_use]
    pub fn active_queue_count(&self) -> usize {
        self.core.resident_count()
    }

    /// Players with a debounced progress write outstanding.
    #[must_use]
    pub fn pending_progress_writes(&self) -> usize {
        self.debouncer.pending()
    }

    #[must_use]
    pub fn integrity_failures(&self) -> u64 {
        self.core.integrity_failures()
    }

    #[must_use]
    pub fn concurrency_conflicts(&self) -> u64 {
        self.core.conflicts()
    }

    pub(super) fn set_state(&self, state: ServiceState) {
        let _ = self.state.send(state);
        crate::metrics::set_service_state(state);
    }

    pub(super) fn epsilon(&self) -> f64 {
        self.config.read().milestone_epsilon
    }
}
