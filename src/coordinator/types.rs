// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the task queue service.

use async_trait::async_trait;
use serde::Serialize;

use crate::queue::{QueueRunState, TaskQueue};
use crate::task::{Reward, Task, TaskProgress};

/// Service lifecycle state.
///
/// ```text
/// Created → Starting → Ready → Running → ShuttingDown → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Just created, not yet started
    Created,
    /// Connecting backends
    Starting,
    /// Ready to accept operations
    Ready,
    /// Background maintenance loop active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Shutdown complete; backends released
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// How a mutation reached durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written before the call returned, at this version
    PersistedImmediately { version: u64 },
    /// Accepted into the write coalescer or progress debouncer. Call
    /// [`super::TaskQueueService::ensure_durable`] to force it out.
    Queued,
}

impl WriteOutcome {
    #[must_use]
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::PersistedImmediately { .. })
    }
}

/// Progress fractions whose updates bypass batching.
pub const MILESTONES: [f64; 4] = [0.25, 0.5, 0.75, 1.0];

/// Whether `progress` sits within `epsilon` of a milestone.
#[must_use]
pub fn is_milestone(progress: f64, epsilon: f64) -> bool {
    MILESTONES.iter().any(|m| (progress - m).abs() <= epsilon)
}

/// Point-in-time view of one player's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub player_id: String,
    /// False when the player has no queue anywhere; every other field is zeroed
    pub exists: bool,
    pub state: String,
    pub current_task: Option<TaskProgress>,
    pub queued_task_ids: Vec<String>,
    pub queue_length: usize,
    pub total_tasks_completed: u64,
    pub total_time_spent: u64,
    pub pause_reason: Option<String>,
    pub version: u64,
    /// Resident state has changes not yet written
    pub has_unsaved_changes: bool,
}

impl QueueStatus {
    #[must_use]
    pub fn empty(player_id: &str) -> Self {
        Self {
            player_id: player_id.to_string(),
            exists: false,
            state: QueueRunState::Idle.to_string(),
            current_task: None,
            queued_task_ids: Vec::new(),
            queue_length: 0,
            total_tasks_completed: 0,
            total_time_spent: 0,
            pause_reason: None,
            version: 0,
            has_unsaved_changes: false,
        }
    }

    #[must_use]
    pub fn from_queue(queue: &TaskQueue, has_unsaved_changes: bool) -> Self {
        Self {
            player_id: queue.player_id.clone(),
            exists: true,
            state: queue.run_state().to_string(),
            current_task: queue.current_task.as_ref().map(Task::progress_view),
            queued_task_ids: queue.queued_tasks.iter().map(|t| t.id.clone()).collect(),
            queue_length: queue.queued_tasks.len(),
            total_tasks_completed: queue.total_tasks_completed,
            total_time_spent: queue.total_time_spent,
            pause_reason: queue.pause_reason.clone(),
            version: queue.version,
            has_unsaved_changes,
        }
    }
}

/// One entry of a heterogeneous batch request.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOperation {
    Add { player_id: String, task: Task },
    Remove { player_id: String, task_id: String },
    UpdateProgress { player_id: String, task_id: String, progress: f64 },
}

impl QueueOperation {
    #[must_use]
    pub fn player_id(&self) -> &str {
        match self {
            Self::Add { player_id, .. } | Self::Remove { player_id, .. } | Self::UpdateProgress { player_id, .. } => {
                player_id
            }
        }
    }
}

/// Result of [`super::TaskQueueService::batch_operations`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `(operation index, error)` for each failed operation
    pub errors: Vec<(usize, String)>,
    /// Players whose queue was written, one save each
    pub persisted_players: Vec<String>,
}

impl BatchResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Aggregate player statistics, cached as frequent data on completion.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    pub player_id: String,
    pub total_tasks_completed: u64,
    pub total_time_spent: u64,
    pub total_rewards_earned: Vec<Reward>,
}

impl PlayerStats {
    #[must_use]
    pub fn cache_name(player_id: &str) -> String {
        format!("player_stats:{}", player_id)
    }
}

/// What [`super::TaskQueueService::shutdown`] did at each step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub debounce_cancelled: usize,
    pub batched_flushed: usize,
    pub queues_persisted: usize,
    pub persist_failures: usize,
}

/// Game-content checks consulted before a task is enqueued (stats, level,
/// inventory). Returns human-readable reasons on rejection.
#[async_trait]
pub trait TaskValidator: Send + Sync {
    async fn validate(&self, player_id: &str, task: &Task) -> Result<(), Vec<String>>;
}

/// Validator that admits every task.
pub struct AcceptAllTasks;

#[async_trait]
impl TaskValidator for AcceptAllTasks {
    async fn validate(&self, _player_id: &str, _task: &Task) -> Result<(), Vec<String>> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    #[test]
    fn test_service_state_display() {
        assert_eq!(format!("{}", ServiceState::Created), "Created");
        assert_eq!(format!("{}", ServiceState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_milestones() {
        assert!(is_milestone(0.25, 0.01));
        assert!(is_milestone(0.505, 0.01));
        assert!(is_milestone(1.0, 0.01));
        assert!(!is_milestone(0.3, 0.01));
        assert!(!is_milestone(0.0, 0.01));
    }

    #[test]
    fn test_status_from_queue() {
        let mut queue = TaskQueue::new("p1");
        queue.enqueue(Task::new("a", TaskType::Crafting, "Smelt", 1_000), 5).unwrap();
        let status = QueueStatus::from_queue(&queue, true);
        assert!(status.exists);
        assert_eq!(status.state, "running");
        assert_eq!(status.queued_task_ids, vec!["a"]);
        assert_eq!(status.current_task.unwrap().task_id, "a");

        let empty = QueueStatus::empty("nobody");
        assert!(!empty.exists);
        assert_eq!(empty.queue_length, 0);
    }

    #[test]
    fn test_batch_result_is_success() {
        let ok = BatchResult { total: 2, succeeded: 2, ..Default::default() };
        assert!(ok.is_success());
        let partial = BatchResult { total: 2, succeeded: 1, failed: 1, ..Default::default() };
        assert!(!partial.is_success());
    }
}
