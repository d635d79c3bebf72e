// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Task Queue Engine
//!
//! Durable per-player task queues: timed activities (harvesting, crafting,
//! combat) that survive restarts, ride out a flaky remote cache, coalesce
//! writes for throughput, and reject unauthorized or malformed mutations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Security Middleware                      │
//! │  • Authenticate → Scope → Rate limit → Validate/Sanitize   │
//! │  • Separate admin path with its own limiter bucket         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TaskQueueService                          │
//! │  • One resident queue per player                           │
//! │  • Milestone progress persists now, the rest is debounced  │
//! └─────────────────────────────────────────────────────────────┘
//!          │ read-through                    │ write-behind
//!          ▼                                 ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  TieredCache             │   │  WriteCoalescer              │
//! │  • Remote (Redis)        │   │  • Batches by (table, op)    │
//! │  • Local fallback        │   │  • Count or age flush        │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                                            │
//!                                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   PersistenceService over ConnectionPool (SQL / memory)     │
//! │  • Version-checked saves, checksum-verified loads          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use task_queue_engine::{TaskQueueService, TaskEngineConfig, Task, TaskType, Reward};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TaskEngineConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         sql_url: Some("sqlite://queues.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let service = TaskQueueService::new(config, rx);
//!     service.start().await.expect("Failed to start");
//!
//!     let task = Task::new("oak-1", TaskType::Harvesting, "Chop oak", 30_000);
//!     service.add_task("player-1", task).await.expect("add failed");
//!     service
//!         .complete_task("player-1", "oak-1", vec![Reward::experience(50)])
//!         .await
//!         .expect("complete failed");
//!
//!     let status = service.get_queue_status("player-1").await.unwrap();
//!     println!("completed: {}", status.total_tasks_completed);
//!
//!     service.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`TaskQueueService`] and its lifecycle
//! - [`queue`] / [`task`]: the data model and its invariants
//! - [`persistence`]: version-checked load/save
//! - [`cache`]: two-tier cache with pressure-driven cleanup
//! - [`batching`]: write coalescer
//! - [`pool`]: store connection pool
//! - [`security`]: request validation middleware
//! - [`storage`]: backends (SQL, Redis, memory)
//! - [`resilience`]: retry and circuit breaking

pub mod batching;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod persistence;
pub mod pool;
pub mod queue;
pub mod resilience;
pub mod security;
pub mod storage;
pub mod task;

pub use batching::{
    BatchConfig, BatchExecutor, BatchFailure, BatchOpType, BatchOperation, BatchPayload, BatchableItem,
    FlushReason, HybridBatcher, WriteCoalescer,
};
pub use cache::{CacheClass, CacheStats, PressureLevel, TieredCache};
pub use config::{RateLimitRule, TaskEngineConfig};
pub use coordinator::{
    AcceptAllTasks, BatchResult, PlayerStats, QueueOperation, QueueStatus, ServiceBackends, ServiceState,
    ShutdownReport, TaskQueueService, TaskValidator, WriteOutcome,
};
pub use metrics::LatencyTimer;
pub use persistence::{IntegrityReport, PersistenceService};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, StoreConnector};
pub use queue::{QueueConfig, QueueError, QueueRunState, QueueSnapshot, TaskQueue};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::RetryConfig;
pub use security::{
    FieldError, RequestContext, SecurityError, SecurityMiddleware, SecurityStatus, TokenClaims, TokenValidator,
    ValidatedRequest,
};
pub use storage::traits::{RecordStore, RemoteCache, StorageError, StoredRecord};
pub use task::{Reward, RewardKind, Task, TaskProgress, TaskType};
