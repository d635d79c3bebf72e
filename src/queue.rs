// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The per-player task queue.
//!
//! A [`TaskQueue`] is the unit of persistence: one record per player,
//! versioned for optimistic concurrency and checksummed for integrity.
//!
//! # Run states
//!
//! ```text
//! Idle (no current task) ⇄ Running (current task executing) ⇄ Paused
//! ```
//!
//! `current_task` mirrors the head of `queued_tasks` while running; both are
//! kept in step by every mutation in this module.
//!
//! # Example
//!
//! ```
//! use task_queue_engine::{TaskQueue, Task, TaskType, Reward, QueueRunState};
//!
//! let mut queue = TaskQueue::new("player-1");
//! let started = queue.enqueue(Task::new("a", TaskType::Crafting, "Smelt", 1_000), 0).unwrap();
//! assert!(started);
//! assert_eq!(queue.run_state(), QueueRunState::Running);
//!
//! queue.complete_current("a", vec![Reward::experience(50)], 1_000).unwrap();
//! assert_eq!(queue.total_tasks_completed, 1);
//! assert_eq!(queue.run_state(), QueueRunState::Idle);
//! ```

use std::collections::{HashSet, VecDeque};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::storage::traits::StorageError;
use crate::task::{Reward, Task, TaskProgress, TaskType};

/// Errors raised by queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid queue state: {0}")]
    InvalidState(String),
    #[error("concurrency conflict on queue '{player_id}': expected version {expected}, found {actual:?}")]
    ConcurrencyConflict {
        player_id: String,
        expected: u64,
        actual: Option<u64>,
    },
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for QueueError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict { key, expected, actual } => QueueError::ConcurrencyConflict {
                player_id: key,
                expected,
                actual,
            },
            other => QueueError::Storage(other),
        }
    }
}

/// Bounded limits applied to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_task_duration_ms: u64,
    pub max_total_queue_duration_ms: u64,
    pub auto_start: bool,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub sync_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 50,
            max_task_duration_ms: 24 * 60 * 60 * 1000,            // 24 hours
            max_total_queue_duration_ms: 7 * 24 * 60 * 60 * 1000, // 7 days
            auto_start: true,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            sync_interval_ms: 5_000,
        }
    }
}

/// Derived run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueRunState {
    Idle,
    Running,
    Paused,
}

impl std::fmt::Display for QueueRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Diagnostic snapshot kept in the bounded state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub timestamp: i64,
    pub current_task_id: Option<String>,
    pub queue_length: usize,
    pub is_running: bool,
    pub is_paused: bool,
    pub total_tasks_completed: u64,
    pub version: u64,
    pub checksum: String,
}

/// One player's queue: the persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueue {
    pub player_id: String,
    pub current_task: Option<Task>,
    pub queued_tasks: Vec<Task>,
    pub is_running: bool,
    pub is_paused: bool,
    #[serde(default)]
    pub pause_reason: Option<String>,
    pub total_tasks_completed: u64,
    pub total_time_spent: u64,
    pub total_rewards_earned: Vec<Reward>,
    pub config: QueueConfig,
    /// Optimistic-concurrency token; bumped on every persisted mutation
    pub version: u64,
    pub checksum: String,
    pub last_updated: i64,
    pub last_synced: i64,
    pub created_at: i64,
    #[serde(default)]
    pub state_history: VecDeque<QueueSnapshot>,
    pub max_history_size: usize,
}

/// Stable projection hashed into the checksum. Progress is stored as
/// integer micro-units so the hash survives a JSON round trip.
#[derive(Serialize)]
struct CanonicalQueue<'a> {
    player_id: &'a str,
    current_task: Option<CanonicalTask<'a>>,
    queued_tasks: Vec<CanonicalTask<'a>>,
    is_running: bool,
    is_paused: bool,
    pause_reason: Option<&'a str>,
    total_tasks_completed: u64,
    total_time_spent: u64,
    total_rewards_earned: &'a [Reward],
    config: &'a QueueConfig,
    version: u64,
}

#[derive(Serialize)]
struct CanonicalTask<'a> {
    id: &'a str,
    task_type: TaskType,
    name: &'a str,
    duration_ms: u64,
    start_time: i64,
    progress_micros: u64,
    completed: bool,
    rewards: &'a [Reward],
    priority: i32,
    retry_count: u32,
    max_retries: u32,
    prerequisites: &'a [String],
}

impl<'a> From<&'a Task> for CanonicalTask<'a> {
    fn from(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            task_type: task.task_type,
            name: &task.name,
            duration_ms: task.duration_ms,
            start_time: task.start_time,
            progress_micros: (task.progress * 1_000_000.0).round() as u64,
            completed: task.completed,
            rewards: &task.rewards,
            priority: task.priority,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            prerequisites: &task.prerequisites,
        }
    }
}

impl TaskQueue {
    /// Create an empty, idle queue at version 0 (never persisted).
    pub fn new(player_id: impl Into<String>) -> Self {
        Self::with_config(player_id, QueueConfig::default(), 10)
    }

    pub fn with_config(player_id: impl Into<String>, config: QueueConfig, max_history_size: usize) -> Self {
        let now = crate::task::epoch_millis();
        let mut queue = Self {
            player_id: player_id.into(),
            current_task: None,
            queued_tasks: Vec::new(),
            is_running: false,
            is_paused: false,
            pause_reason: None,
            total_tasks_completed: 0,
            total_time_spent: 0,
            total_rewards_earned: Vec::new(),
            config,
            version: 0,
            checksum: String::new(),
            last_updated: now,
            last_synced: 0,
            created_at: now,
            state_history: VecDeque::new(),
            max_history_size,
        };
        queue.checksum = queue.compute_checksum();
        queue
    }

    #[must_use]
    pub fn run_state(&self) -> QueueRunState {
        if self.is_paused {
            QueueRunState::Paused
        } else if self.is_running {
            QueueRunState::Running
        } else {
            QueueRunState::Idle
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queued_tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued_tasks.is_empty()
    }

    #[must_use]
    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.queued_tasks.iter().find(|t| t.id == task_id)
    }

    #[must_use]
    pub fn current_task_id(&self) -> Option<&str> {
        self.current_task.as_ref().map(|t| t.id.as_str())
    }

    /// Sum of queued durations, current task included.
    #[must_use]
    pub fn total_queued_duration_ms(&self) -> u64 {
        self.queued_tasks.iter().map(|t| t.duration_ms).sum()
    }

    /// Check a task against this queue's limits without mutating.
    pub fn check_admission(&self, task: &Task) -> Result<(), QueueError> {
        let mut errors = Vec::new();
        if self.queued_tasks.len() >= self.config.max_queue_size {
            errors.push(format!("queue is full ({} tasks)", self.config.max_queue_size));
        }
        if self.find_task(&task.id).is_some() {
            errors.push(format!("task '{}' is already queued", task.id));
        }
        if task.duration_ms == 0 {
            errors.push("task duration must be positive".to_string());
        }
        if task.duration_ms > self.config.max_task_duration_ms {
            errors.push(format!(
                "task duration {}ms exceeds limit {}ms",
                task.duration_ms, self.config.max_task_duration_ms
            ));
        }
        let total = self.total_queued_duration_ms().saturating_add(task.duration_ms);
        if total > self.config.max_total_queue_duration_ms {
            errors.push(format!(
                "total queue duration {}ms exceeds limit {}ms",
                total, self.config.max_total_queue_duration_ms
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Validation(errors))
        }
    }

    /// Append a task (FIFO). Returns `true` if the queue auto-started with it.
    pub fn enqueue(&mut self, mut task: Task, now_ms: i64) -> Result<bool, QueueError> {
        self.check_admission(&task)?;
        task.completed = false;
        task.rewards.clear();
        self.queued_tasks.push(task);
        self.last_updated = now_ms;

        let idle = !self.is_running && !self.is_paused && self.current_task.is_none();
        if idle && self.config.auto_start {
            self.promote_next(now_ms);
            return Ok(self.is_running);
        }
        Ok(false)
    }

    /// Update the current task's progress. A no-op (`None`) for any other task.
    pub fn update_current_progress(&mut self, task_id: &str, progress: f64, now_ms: i64) -> Option<TaskProgress> {
        if self.current_task_id() != Some(task_id) {
            return None;
        }
        let current = self.current_task.as_mut()?;
        current.set_progress(progress);
        let view = current.progress_view();
        let clamped = current.progress;
        if let Some(head) = self.queued_tasks.iter_mut().find(|t| t.id == task_id) {
            head.progress = clamped;
        }
        self.last_updated = now_ms;
        Some(view)
    }

    /// Complete the current task, fold its stats in, and advance.
    ///
    /// Fails with [`QueueError::InvalidState`] (leaving the queue untouched)
    /// unless `task_id` is the current task.
    pub fn complete_current(&mut self, task_id: &str, rewards: Vec<Reward>, now_ms: i64) -> Result<Task, QueueError> {
        match self.current_task_id() {
            Some(current) if current == task_id => {}
            Some(current) => {
                return Err(QueueError::InvalidState(format!(
                    "task '{}' is not the current task (current is '{}')",
                    task_id, current
                )))
            }
            None => {
                return Err(QueueError::InvalidState(format!(
                    "task '{}' cannot complete: queue has no current task",
                    task_id
                )))
            }
        }

        let Some(mut done) = self.current_task.take() else {
            return Err(QueueError::InvalidState("current task vanished".to_string()));
        };
        done.completed = true;
        done.progress = 1.0;
        done.rewards = rewards;

        self.total_tasks_completed += 1;
        self.total_time_spent = self.total_time_spent.saturating_add(done.duration_ms);
        self.total_rewards_earned.extend(done.rewards.iter().cloned());
        self.queued_tasks.retain(|t| t.id != task_id);
        self.is_running = false;
        self.promote_next(now_ms);
        self.last_updated = now_ms;
        Ok(done)
    }

    /// Drop any queued task, promoting the next one if it was current.
    pub fn remove_task(&mut self, task_id: &str, now_ms: i64) -> Option<Task> {
        let index = self.queued_tasks.iter().position(|t| t.id == task_id)?;
        let removed = self.queued_tasks.remove(index);
        if self.current_task_id() == Some(task_id) {
            self.current_task = None;
            self.is_running = false;
            self.promote_next(now_ms);
        }
        self.last_updated = now_ms;
        Some(removed)
    }

    /// Clear every task and run flag.
    pub fn stop_all(&mut self, now_ms: i64) {
        self.current_task = None;
        self.queued_tasks.clear();
        self.is_running = false;
        self.is_paused = false;
        self.pause_reason = None;
        self.last_updated = now_ms;
    }

    pub fn pause(&mut self, reason: impl Into<String>, now_ms: i64) -> Result<(), QueueError> {
        if self.is_paused {
            return Err(QueueError::InvalidState("queue is already paused".to_string()));
        }
        self.is_paused = true;
        self.is_running = false;
        self.pause_reason = Some(reason.into());
        self.last_updated = now_ms;
        Ok(())
    }

    pub fn resume(&mut self, now_ms: i64) -> Result<(), QueueError> {
        if !self.is_paused {
            return Err(QueueError::InvalidState("queue is not paused".to_string()));
        }
        self.is_paused = false;
        self.pause_reason = None;
        if self.current_task.is_some() {
            self.is_running = true;
        } else {
            self.promote_next(now_ms);
        }
        self.last_updated = now_ms;
        Ok(())
    }

    /// Make the head of `queued_tasks` current, or go idle when empty.
    fn promote_next(&mut self, now_ms: i64) {
        if self.is_paused {
            self.is_running = false;
            return;
        }
        match self.queued_tasks.first_mut() {
            Some(head) => {
                if head.start_time <= 0 {
                    head.start(now_ms);
                }
                self.current_task = Some(head.clone());
                self.is_running = true;
            }
            None => {
                self.current_task = None;
                self.is_running = false;
            }
        }
    }

    /// SHA-256 over the canonical queue content, hex encoded.
    #[must_use]
    pub fn compute_checksum(&self) -> String {
        let canonical = CanonicalQueue {
            player_id: &self.player_id,
            current_task: self.current_task.as_ref().map(CanonicalTask::from),
            queued_tasks: self.queued_tasks.iter().map(CanonicalTask::from).collect(),
            is_running: self.is_running,
            is_paused: self.is_paused,
            pause_reason: self.pause_reason.as_deref(),
            total_tasks_completed: self.total_tasks_completed,
            total_time_spent: self.total_time_spent,
            total_rewards_earned: &self.total_rewards_earned,
            config: &self.config,
            version: self.version,
        };
        // Serializing plain structs of strings/ints cannot fail
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    #[must_use]
    pub fn snapshot(&self, now_ms: i64) -> QueueSnapshot {
        QueueSnapshot {
            timestamp: now_ms,
            current_task_id: self.current_task_id().map(String::from),
            queue_length: self.queued_tasks.len(),
            is_running: self.is_running,
            is_paused: self.is_paused,
            total_tasks_completed: self.total_tasks_completed,
            version: self.version,
            checksum: self.compute_checksum(),
        }
    }

    /// Append to the history ring, evicting the oldest beyond `max_history_size`.
    pub fn push_snapshot(&mut self, snapshot: QueueSnapshot) {
        self.state_history.push_back(snapshot);
        while self.state_history.len() > self.max_history_size {
            self.state_history.pop_front();
        }
    }

    /// Structural invariants. Empty result means consistent.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.is_paused && self.is_running {
            issues.push("queue is both paused and running".to_string());
        }
        if self.is_running && self.current_task.is_none() {
            issues.push("running queue has no current task".to_string());
        }
        if let Some(current) = &self.current_task {
            if self.is_running && self.queued_tasks.first().map(|t| t.id.as_str()) != Some(current.id.as_str()) {
                issues.push(format!("current task '{}' is not the queue head", current.id));
            }
        }
        let mut seen = HashSet::new();
        for task in self.queued_tasks.iter().chain(self.current_task.iter()) {
            if !(0.0..=1.0).contains(&task.progress) {
                issues.push(format!("task '{}' progress {} out of range", task.id, task.progress));
            }
        }
        for task in &self.queued_tasks {
            if !seen.insert(task.id.as_str()) {
                issues.push(format!("duplicate task id '{}'", task.id));
            }
        }
        if self.state_history.len() > self.max_history_size {
            issues.push(format!(
                "state history {} exceeds limit {}",
                self.state_history.len(),
                self.max_history_size
            ));
        }
        issues
    }
}
