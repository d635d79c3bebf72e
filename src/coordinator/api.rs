// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue operations: add, progress, complete, remove, stop, pause, batch.
//!
//! Write policy per operation:
//!
//! | Operation | Durability |
//! |---|---|
//! | `add_task`, `complete_task`, `remove_task`, pause/resume | coalesced (`Queued`) |
//! | `update_task_progress` at a milestone | immediate |
//! | `update_task_progress` otherwise | debounced per player, then coalesced |
//! | `stop_all_tasks`, `batch_operations`, `ensure_durable` | immediate |
//!
//! Resident slot locks are never held across `add_to_batch`, which may
//! flush inline and re-lock the same slot.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::resident::QueueSlot;
use super::types::{is_milestone, BatchResult, PlayerStats, QueueOperation, QueueStatus, WriteOutcome};
use super::{ServiceState, TaskQueueService};
use crate::batching::BatchOperation;
use crate::queue::{QueueError, TaskQueue};
use crate::task::{epoch_millis, Reward, Task, TaskProgress};

/// Batch priorities: completions and run-state changes go out ahead of appends.
const PRIORITY_COMPLETE: i32 = 10;
const PRIORITY_RUN_STATE: i32 = 5;

impl TaskQueueService {
    fn ensure_accepting(&self) -> Result<(), QueueError> {
        match self.state() {
            ServiceState::ShuttingDown | ServiceState::Stopped => {
                Err(QueueError::Unavailable(format!("service is {}", self.state())))
            }
            _ => Ok(()),
        }
    }

    async fn existing_slot(&self, player_id: &str) -> Result<QueueSlot, QueueError> {
        self.core
            .load_or_create(player_id, false)
            .await?
            .ok_or_else(|| QueueError::InvalidState(format!("player '{}' has no queue", player_id)))
    }

    fn table(&self) -> &str {
        self.core.table()
    }

    /// Drop every not-yet-written path for a player ahead of a synchronous save.
    fn supersede_pending(&self, player_id: &str) {
        self.debouncer.cancel(player_id);
        self.coalescer.cancel_pending(self.table(), player_id);
    }

    /// Append a task, creating the player's queue if needed. An idle queue
    /// starts running with it.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn add_task(&self, player_id: &str, task: Task) -> Result<WriteOutcome, QueueError> {
        self.ensure_accepting()?;
        self.validator
            .validate(player_id, &task)
            .await
            .map_err(QueueError::Validation)?;

        let slot = self
            .core
            .load_or_create(player_id, true)
            .await?
            .ok_or_else(|| QueueError::InvalidState(format!("could not create queue for '{}'", player_id)))?;

        let priority = task.priority;
        let (op, snapshot, started) = {
            let mut resident = slot.lock().await;
            let started = resident.queue.enqueue(task, epoch_millis())?;
            resident.dirty = true;
            let op = BatchOperation::add(self.table(), &resident.queue, priority)?;
            (op, resident.queue.clone(), started)
        };

        let cache = self.core.cache();
        cache.cache_active_queue_state(&snapshot).await;
        if let Some(current) = &snapshot.current_task {
            cache.cache_task_progress(player_id, &current.progress_view()).await;
        }
        self.coalescer.add_to_batch(op).await;

        debug!(queue_length = snapshot.queued_tasks.len(), started, "Task queued");
        crate::metrics::record_operation("service", "add_task", "success");
        Ok(WriteOutcome::Queued)
    }

    /// Record progress on the player's current task. `None` when `task_id`
    /// is not current (or the player has no queue).
    ///
    /// Milestones (see [`super::MILESTONES`]) persist before returning;
    /// anything else is debounced.
    #[tracing::instrument(skip(self))]
    pub async fn update_task_progress(
        &self,
        player_id: &str,
        task_id: &str,
        progress: f64,
    ) -> Result<Option<WriteOutcome>, QueueError> {
        self.ensure_accepting()?;
        let Some(slot) = self.core.load_or_create(player_id, false).await? else {
            return Ok(None);
        };

        let mut resident = slot.lock().await;
        let Some(view) = resident.queue.update_current_progress(task_id, progress, epoch_millis()) else {
            return Ok(None);
        };
        resident.dirty = true;
        self.core.cache().cache_task_progress(player_id, &view).await;

        if is_milestone(view.progress, self.epsilon()) {
            self.supersede_pending(player_id);
            let version = self.core.persist_now(&mut resident).await?;
            crate::metrics::record_progress_persist("immediate");
            debug!(progress = view.progress, version, "Milestone persisted");
            return Ok(Some(WriteOutcome::PersistedImmediately { version }));
        }
        drop(resident);

        self.debouncer.schedule(player_id);
        crate::metrics::record_progress_persist("debounced");
        Ok(Some(WriteOutcome::Queued))
    }

    /// Complete the current task and advance. Fails with
    /// [`QueueError::InvalidState`] for any other task, leaving the queue as is.
    #[tracing::instrument(skip(self, rewards), fields(rewards = rewards.len()))]
    pub async fn complete_task(
        &self,
        player_id: &str,
        task_id: &str,
        rewards: Vec<Reward>,
    ) -> Result<(Task, WriteOutcome), QueueError> {
        self.ensure_accepting()?;
        let slot = self.existing_slot(player_id).await?;

        let (done, op, snapshot) = {
            let mut resident = slot.lock().await;
            let done = resident.queue.complete_current(task_id, rewards, epoch_millis())?;
            resident.dirty = true;
            let op = BatchOperation::update(self.table(), &resident.queue, PRIORITY_COMPLETE)?;
            (done, op, resident.queue.clone())
        };
        // The completion write carries any settled progress with it
        self.debouncer.cancel(player_id);

        let stats = PlayerStats {
            player_id: player_id.to_string(),
            total_tasks_completed: snapshot.total_tasks_completed,
            total_time_spent: snapshot.total_time_spent,
            total_rewards_earned: snapshot.total_rewards_earned.clone(),
        };
        let cache = self.core.cache();
        cache.cache_active_queue_state(&snapshot).await;
        cache.cache_task_progress(player_id, &done.progress_view()).await;
        cache.cache_frequent_data(&PlayerStats::cache_name(player_id), &stats).await;
        self.coalescer.add_to_batch(op).await;

        info!(
            next = snapshot.current_task_id().unwrap_or("-"),
            completed = snapshot.total_tasks_completed,
            "Task completed"
        );
        crate::metrics::record_operation("service", "complete_task", "success");
        Ok((done, WriteOutcome::Queued))
    }

    /// Drop a queued task; the next one is promoted if it was current.
    #[tracing::instrument(skip(self))]
    pub async fn remove_task(&self, player_id: &str, task_id: &str) -> Result<Option<WriteOutcome>, QueueError> {
        self.ensure_accepting()?;
        let Some(slot) = self.core.load_or_create(player_id, false).await? else {
            return Ok(None);
        };

        let (op, snapshot, was_current) = {
            let mut resident = slot.lock().await;
            let was_current = resident.queue.current_task_id() == Some(task_id);
            if resident.queue.remove_task(task_id, epoch_millis()).is_none() {
                return Ok(None);
            }
            resident.dirty = true;
            let op = BatchOperation::remove(self.table(), player_id, task_id, 0)?;
            (op, resident.queue.clone(), was_current)
        };
        if was_current {
            self.debouncer.cancel(player_id);
        }

        self.core.cache().cache_active_queue_state(&snapshot).await;
        self.coalescer.add_to_batch(op).await;
        Ok(Some(WriteOutcome::Queued))
    }

    /// Clear every task and run flag, persisting synchronously.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all_tasks(&self, player_id: &str) -> Result<Option<WriteOutcome>, QueueError> {
        self.ensure_accepting()?;
        let Some(slot) = self.core.load_or_create(player_id, false).await? else {
            return Ok(None);
        };

        let mut resident = slot.lock().await;
        resident.queue.stop_all(epoch_millis());
        resident.dirty = true;
        self.supersede_pending(player_id);
        let version = self.core.persist_now(&mut resident).await?;

        info!(version, "All tasks stopped");
        crate::metrics::record_operation("service", "stop_all", "success");
        Ok(Some(WriteOutcome::PersistedImmediately { version }))
    }

    /// Pause the queue. Pausing an idle queue holds back auto-start.
    #[tracing::instrument(skip(self))]
    pub async fn pause_queue(&self, player_id: &str, reason: &str) -> Result<WriteOutcome, QueueError> {
        self.ensure_accepting()?;
        let slot = self.existing_slot(player_id).await?;
        let (op, snapshot) = {
            let mut resident = slot.lock().await;
            resident.queue.pause(reason, epoch_millis())?;
            resident.dirty = true;
            let op = BatchOperation::update(self.table(), &resident.queue, PRIORITY_RUN_STATE)?;
            (op, resident.queue.clone())
        };
        self.core.cache().cache_active_queue_state(&snapshot).await;
        self.coalescer.add_to_batch(op).await;
        Ok(WriteOutcome::Queued)
    }

    #[tracing::instrument(skip(self))]
    pub async fn resume_queue(&self, player_id: &str) -> Result<WriteOutcome, QueueError> {
        self.ensure_accepting()?;
        let slot = self.existing_slot(player_id).await?;
        let (op, snapshot) = {
            let mut resident = slot.lock().await;
            resident.queue.resume(epoch_millis())?;
            resident.dirty = true;
            let op = BatchOperation::update(self.table(), &resident.queue, PRIORITY_RUN_STATE)?;
            (op, resident.queue.clone())
        };
        self.core.cache().cache_active_queue_state(&snapshot).await;
        self.coalescer.add_to_batch(op).await;
        Ok(WriteOutcome::Queued)
    }

    /// Apply a mixed list of operations, saving each affected player once.
    ///
    /// Individual operation failures are reported in the result; the call
    /// itself only fails when the service is not accepting work.
    #[tracing::instrument(skip(self, operations), fields(count = operations.len()))]
    pub async fn batch_operations(&self, operations: Vec<QueueOperation>) -> Result<BatchResult, QueueError> {
        self.ensure_accepting()?;
        let mut result = BatchResult {
            total: operations.len(),
            ..Default::default()
        };

        // Group by player, keeping first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<(usize, QueueOperation)>> = HashMap::new();
        for (index, op) in operations.into_iter().enumerate() {
            let player_id = op.player_id().to_string();
            groups
                .entry(player_id.clone())
                .or_insert_with(|| {
                    order.push(player_id.clone());
                    Vec::new()
                })
                .push((index, op));
        }

        for player_id in order {
            let Some(group) = groups.remove(&player_id) else {
                continue;
            };
            self.apply_player_group(&player_id, group, &mut result).await;
        }

        result.errors.sort_by_key(|(index, _)| *index);
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            players = result.persisted_players.len(),
            "Batch applied"
        );
        Ok(result)
    }

    async fn apply_player_group(&self, player_id: &str, group: Vec<(usize, QueueOperation)>, result: &mut BatchResult) {
        // External validation runs before the queue is locked
        let mut admitted = Vec::with_capacity(group.len());
        for (index, op) in group {
            if let QueueOperation::Add { task, .. } = &op {
                if let Err(reasons) = self.validator.validate(player_id, task).await {
                    fail(result, index, QueueError::Validation(reasons).to_string());
                    continue;
                }
            }
            admitted.push((index, op));
        }
        if admitted.is_empty() {
            return;
        }

        let create = admitted.iter().any(|(_, op)| matches!(op, QueueOperation::Add { .. }));
        let slot = match self.core.load_or_create(player_id, create).await {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                for (index, _) in admitted {
                    fail(result, index, format!("player '{}' has no queue", player_id));
                }
                return;
            }
            Err(e) => {
                for (index, _) in admitted {
                    fail(result, index, e.to_string());
                }
                return;
            }
        };

        let mut resident = slot.lock().await;
        let now = epoch_millis();
        let mut applied = Vec::new();
        for (index, op) in admitted {
            let outcome = match op {
                QueueOperation::Add { task, .. } => resident.queue.enqueue(task, now).map(|_| ()),
                QueueOperation::Remove { task_id, .. } => resident
                    .queue
                    .remove_task(&task_id, now)
                    .map(|_| ())
                    .ok_or_else(|| QueueError::InvalidState(format!("task '{}' is not queued", task_id))),
                QueueOperation::UpdateProgress { task_id, progress, .. } => resident
                    .queue
                    .update_current_progress(&task_id, progress, now)
                    .map(|_| ())
                    .ok_or_else(|| QueueError::InvalidState(format!("task '{}' is not current", task_id))),
            };
            match outcome {
                Ok(()) => applied.push(index),
                Err(e) => fail(result, index, e.to_string()),
            }
        }
        if applied.is_empty() {
            return;
        }

        resident.dirty = true;
        self.supersede_pending(player_id);
        match self.core.persist_now(&mut resident).await {
            Ok(_) => {
                result.succeeded += applied.len();
                result.persisted_players.push(player_id.to_string());
            }
            Err(e) => {
                warn!(player_id, error = %e, "Batch save failed");
                for index in applied {
                    fail(result, index, format!("save failed: {}", e));
                }
            }
        }
    }

    /// Status from the resident queue, else cache, else store. A player with
    /// no queue gets an empty status rather than an error.
    #[tracing::instrument(skip(self))]
    pub async fn get_queue_status(&self, player_id: &str) -> Result<QueueStatus, QueueError> {
        if let Some(slot) = self.core.slot(player_id) {
            let resident = slot.lock().await;
            return Ok(QueueStatus::from_queue(&resident.queue, resident.dirty));
        }
        Ok(match self.core.fetch(player_id).await? {
            Some(queue) => QueueStatus::from_queue(&queue, false),
            None => QueueStatus::empty(player_id),
        })
    }

    /// Bring a player's queue into memory and return a copy of it.
    #[tracing::instrument(skip(self))]
    pub async fn load_queue(&self, player_id: &str) -> Result<Option<TaskQueue>, QueueError> {
        match self.core.load_or_create(player_id, false).await? {
            Some(slot) => Ok(Some(slot.lock().await.queue.clone())),
            None => Ok(None),
        }
    }

    /// Cached progress projection for a task, falling back to the resident queue.
    pub async fn get_task_progress(&self, player_id: &str, task_id: &str) -> Option<TaskProgress> {
        if let Some(progress) = self.core.cache().get_cached_task_progress(player_id, task_id).await {
            return Some(progress);
        }
        let slot = self.core.slot(player_id)?;
        let resident = slot.lock().await;
        resident
            .queue
            .current_task
            .as_ref()
            .filter(|t| t.id == task_id)
            .map(Task::progress_view)
    }

    /// Advance the current task's progress from elapsed wall-clock time.
    pub async fn poll_progress(&self, player_id: &str) -> Result<Option<TaskProgress>, QueueError> {
        let Some(slot) = self.core.slot(player_id) else {
            return Ok(None);
        };
        let observed = {
            let resident = slot.lock().await;
            if resident.queue.is_paused {
                None
            } else {
                resident
                    .queue
                    .current_task
                    .as_ref()
                    .map(|t| (t.id.clone(), t.elapsed_progress(epoch_millis())))
            }
        };
        let Some((task_id, progress)) = observed else {
            return Ok(None);
        };
        if self.update_task_progress(player_id, &task_id, progress).await?.is_none() {
            return Ok(None);
        }
        Ok(self.get_task_progress(player_id, &task_id).await)
    }

    /// Persist the player's resident queue now, discarding any pending
    /// batched or debounced write for it. Returns the durable version, or
    /// `None` when the player is not resident.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_durable(&self, player_id: &str) -> Result<Option<u64>, QueueError> {
        let Some(slot) = self.core.slot(player_id) else {
            return Ok(None);
        };
        self.supersede_pending(player_id);
        let mut resident = slot.lock().await;
        if !resident.dirty {
            return Ok(Some(resident.queue.version));
        }
        self.core.persist_now(&mut resident).await.map(Some)
    }

    /// Page through stored player ids.
    pub async fn list_queues(&self, offset: u64, limit: usize) -> Result<Vec<String>, QueueError> {
        self.core.persistence().list_player_ids(offset, limit).await
    }

    /// Delete a player's queue from every tier.
    #[tracing::instrument(skip(self))]
    pub async fn reset_queue(&self, player_id: &str) -> Result<(), QueueError> {
        self.ensure_accepting()?;
        self.supersede_pending(player_id);
        self.core.delete(player_id).await?;
        warn!(player_id, "Queue reset");
        Ok(())
    }
}

fn fail(result: &mut BatchResult, index: usize, error: String) {
    result.failed += 1;
    result.errors.push((index, error));
}
