// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task data structures.
//!
//! A [`Task`] is one timed player activity (harvesting, crafting, combat).
//! Progress is a fraction in `[0, 1]` derived from elapsed wall-clock time;
//! rewards stay empty until the task is completed.
//!
//! # Example
//!
//! ```
//! use task_queue_engine::{Task, TaskType};
//!
//! let mut task = Task::new("oak-1", TaskType::Harvesting, "Chop oak", 30_000)
//!     .with_priority(5);
//!
//! task.set_progress(1.7);
//! assert_eq!(task.progress, 1.0); // clamped
//! assert!(task.rewards.is_empty());
//! ```

use serde::{Deserialize, Serialize};

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Closed set of activity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Harvesting,
    Crafting,
    Combat,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Harvesting, TaskType::Crafting, TaskType::Combat];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Harvesting => "harvesting",
            Self::Crafting => "crafting",
            Self::Combat => "combat",
        }
    }

    /// Parse the wire name. Unknown names yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of reward granted on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardKind {
    Experience,
    Item,
    Currency,
}

impl RewardKind {
    pub const ALL: [RewardKind; 3] = [RewardKind::Experience, RewardKind::Item, RewardKind::Currency];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Experience => "experience",
            Self::Item => "item",
            Self::Currency => "currency",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// A single reward entry, e.g. `{"type": "experience", "amount": 50}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    #[serde(rename = "type")]
    pub kind: RewardKind,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl Reward {
    #[must_use]
    pub fn experience(amount: u64) -> Self {
        Self { kind: RewardKind::Experience, amount, item_id: None }
    }

    #[must_use]
    pub fn currency(amount: u64) -> Self {
        Self { kind: RewardKind::Currency, amount, item_id: None }
    }

    #[must_use]
    pub fn item(item_id: impl Into<String>, amount: u64) -> Self {
        Self { kind: RewardKind::Item, amount, item_id: Some(item_id.into()) }
    }
}

/// A resource the player must hold for the task to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource_id: String,
    pub quantity: u32,
}

/// One timed activity inside a player's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique within the owning queue
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub name: String,
    /// Total run time in milliseconds
    pub duration_ms: u64,
    /// Epoch millis when the task became current (0 while waiting)
    #[serde(default)]
    pub start_time: i64,
    /// Fraction complete, always within `[0, 1]`
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub completed: bool,
    /// Empty until completion
    #[serde(default)]
    pub rewards: Vec<Reward>,
    /// Tie-break only; never reorders the queue
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub resource_requirements: Vec<ResourceRequirement>,
}

fn default_max_retries() -> u32 { 3 }

impl Task {
    pub fn new(id: impl Into<String>, task_type: TaskType, name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            task_type,
            name: name.into(),
            duration_ms,
            start_time: 0,
            progress: 0.0,
            completed: false,
            rewards: Vec::new(),
            priority: 0,
            retry_count: 0,
            max_retries: default_max_retries(),
            prerequisites: Vec::new(),
            resource_requirements: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_prerequisites(mut self, prerequisites: Vec<String>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>, quantity: u32) -> Self {
        self.resource_requirements.push(ResourceRequirement {
            resource_id: resource_id.into(),
            quantity,
        });
        self
    }

    /// Set progress, clamping into `[0, 1]`. NaN is treated as 0.
    pub fn set_progress(&mut self, progress: f64) {
        self.progress = clamp_progress(progress);
    }

    /// Mark the task as started now.
    pub fn start(&mut self, now_ms: i64) {
        self.start_time = now_ms;
    }

    /// Progress implied by elapsed wall-clock time since `start_time`.
    #[must_use]
    pub fn elapsed_progress(&self, now_ms: i64) -> f64 {
        if self.start_time <= 0 {
            return self.progress;
        }
        if self.duration_ms == 0 {
            return 1.0;
        }
        let elapsed = now_ms.saturating_sub(self.start_time).max(0) as f64;
        clamp_progress(elapsed / self.duration_ms as f64)
    }

    /// Milliseconds left according to current progress.
    #[must_use]
    pub fn time_remaining_ms(&self) -> u64 {
        ((1.0 - self.progress) * self.duration_ms as f64).round().max(0.0) as u64
    }

    /// Cache-only projection of this task's progress.
    #[must_use]
    pub fn progress_view(&self) -> TaskProgress {
        TaskProgress {
            task_id: self.id.clone(),
            progress: self.progress,
            time_remaining_ms: self.time_remaining_ms(),
            is_complete: self.completed || self.progress >= 1.0,
        }
    }
}

/// Clamp into `[0, 1]`, mapping NaN to 0.
#[must_use]
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Derived progress projection kept in the cache. Never the system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub progress: f64,
    pub time_remaining_ms: u64,
    pub is_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("t1", TaskType::Crafting, "Smelt bar", 10_000);
        assert_eq!(task.id, "t1");
        assert_eq!(task.progress, 0.0);
        assert!(!task.completed);
        assert!(task.rewards.is_empty());
        assert_eq!(task.priority, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.start_time, 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut task = Task::new("t1", TaskType::Combat, "Fight", 1_000);
        task.set_progress(-0.5);
        assert_eq!(task.progress, 0.0);
        task.set_progress(2.0);
        assert_eq!(task.progress, 1.0);
        task.set_progress(f64::NAN);
        assert_eq!(task.progress, 0.0);
        task.set_progress(0.4);
        assert!((task.progress - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_elapsed_progress() {
        let mut task = Task::new("t1", TaskType::Harvesting, "Chop", 1_000);
        task.start(10_000);
        assert!((task.elapsed_progress(10_500) - 0.5).abs() < 1e-9);
        assert_eq!(task.elapsed_progress(99_999), 1.0);
        // Clock skew backwards never yields negative progress
        assert_eq!(task.elapsed_progress(9_000), 0.0);
    }

    #[test]
    fn test_elapsed_progress_unstarted_keeps_stored_value() {
        let mut task = Task::new("t1", TaskType::Harvesting, "Chop", 1_000);
        task.set_progress(0.3);
        assert!((task.elapsed_progress(50_000) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_time_remaining() {
        let mut task = Task::new("t1", TaskType::Crafting, "Craft", 2_000);
        task.set_progress(0.25);
        assert_eq!(task.time_remaining_ms(), 1_500);
        let view = task.progress_view();
        assert_eq!(view.task_id, "t1");
        assert!(!view.is_complete);
    }

    #[test]
    fn test_reward_wire_format() {
        let reward = Reward::experience(50);
        let json = serde_json::to_value(&reward).unwrap();
        assert_eq!(json, serde_json::json!({"type": "experience", "amount": 50}));

        let parsed: Reward = serde_json::from_value(serde_json::json!({"type": "item", "amount": 2, "item_id": "oak_log"})).unwrap();
        assert_eq!(parsed, Reward::item("oak_log", 2));
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        let result: Result<TaskType, _> = serde_json::from_str("\"fishing\"");
        assert!(result.is_err());
        assert_eq!(TaskType::parse("combat"), Some(TaskType::Combat));
        assert_eq!(TaskType::parse("fishing"), None);
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let task = Task::new("t1", TaskType::Crafting, "Craft", 1_000).with_resource("ore", 3);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "crafting");
        assert!(json.get("durationMs").is_some());
        assert_eq!(json["resourceRequirements"][0]["quantity"], 3);
    }
}
