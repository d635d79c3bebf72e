// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch operations: the closed set of writes the coalescer accepts.
//!
//! Each variant carries its own typed payload, and construction rejects
//! malformed operations up front, so flush code never sees an
//! operation it cannot execute.
//!
//! # Example
//!
//! ```
//! use task_queue_engine::{BatchOperation, BatchOpType, TaskQueue};
//!
//! let queue = TaskQueue::new("player-1");
//! let op = BatchOperation::update("task_queues", &queue, 0).unwrap();
//! assert_eq!(op.op_type(), BatchOpType::Update);
//! assert_eq!(op.key, "player-1");
//!
//! assert!(BatchOperation::delete("", "player-1", 0).is_err());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::hybrid_batcher::BatchableItem;
use crate::queue::{QueueError, TaskQueue};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch operation has an empty table name")]
    EmptyTableName,
    #[error("batch operation has an empty key")]
    EmptyKey,
    #[error("queue payload for '{player_id}' does not match key '{key}'")]
    PayloadMismatch { key: String, player_id: String },
    #[error("malformed batch operation: {0}")]
    Malformed(String),
}

impl From<BatchError> for QueueError {
    fn from(err: BatchError) -> Self {
        QueueError::InvalidState(err.to_string())
    }
}

/// Operation kind; half of the coalescer's batch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOpType {
    Add,
    Update,
    Remove,
    Delete,
}

impl BatchOpType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for BatchOpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload per operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchPayload {
    /// A task was appended; carries the queue state after the append
    Add { queue: Box<TaskQueue> },
    /// Queue state changed in place (progress, pause, resume)
    Update { queue: Box<TaskQueue> },
    /// A task was dropped from the queue
    Remove { task_id: String },
    /// The whole record goes away
    Delete,
}

impl BatchPayload {
    #[must_use]
    pub fn op_type(&self) -> BatchOpType {
        match self {
            Self::Add { .. } => BatchOpType::Add,
            Self::Update { .. } => BatchOpType::Update,
            Self::Remove { .. } => BatchOpType::Remove,
            Self::Delete => BatchOpType::Delete,
        }
    }

    /// Queue snapshot carried by the payload, if any.
    #[must_use]
    pub fn queue(&self) -> Option<&TaskQueue> {
        match self {
            Self::Add { queue } | Self::Update { queue } => Some(queue),
            Self::Remove { .. } | Self::Delete => None,
        }
    }
}

/// Grouping key inside the coalescer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub table_name: String,
    pub op_type: BatchOpType,
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table_name, self.op_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub id: Uuid,
    pub table_name: String,
    pub key: String,
    #[serde(flatten)]
    pub payload: BatchPayload,
    pub timestamp: i64,
    pub priority: i32,
}

impl BatchOperation {
    pub fn new(
        table_name: impl Into<String>,
        key: impl Into<String>,
        payload: BatchPayload,
        priority: i32,
    ) -> Result<Self, BatchError> {
        let op = Self {
            id: Uuid::new_v4(),
            table_name: table_name.into(),
            key: key.into(),
            payload,
            timestamp: crate::task::epoch_millis(),
            priority,
        };
        op.validate()?;
        Ok(op)
    }

    pub fn add(table_name: &str, queue: &TaskQueue, priority: i32) -> Result<Self, BatchError> {
        Self::new(
            table_name,
            queue.player_id.clone(),
            BatchPayload::Add { queue: Box::new(queue.clone()) },
            priority,
        )
    }

    pub fn update(table_name: &str, queue: &TaskQueue, priority: i32) -> Result<Self, BatchError> {
        Self::new(
            table_name,
            queue.player_id.clone(),
            BatchPayload::Update { queue: Box::new(queue.clone()) },
            priority,
        )
    }

    pub fn remove(table_name: &str, player_id: &str, task_id: &str, priority: i32) -> Result<Self, BatchError> {
        if task_id.is_empty() {
            return Err(BatchError::Malformed("remove requires a task id".to_string()));
        }
        Self::new(
            table_name,
            player_id,
            BatchPayload::Remove { task_id: task_id.to_string() },
            priority,
        )
    }

    pub fn delete(table_name: &str, key: &str, priority: i32) -> Result<Self, BatchError> {
        Self::new(table_name, key, BatchPayload::Delete, priority)
    }

    /// Parse a wire operation; unknown `type` values are rejected here.
    pub fn from_json(value: serde_json::Value) -> Result<Self, BatchError> {
        let op: Self = serde_json::from_value(value).map_err(|e| BatchError::Malformed(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    fn validate(&self) -> Result<(), BatchError> {
        if self.table_name.trim().is_empty() {
            return Err(BatchError::EmptyTableName);
        }
        if self.key.trim().is_empty() {
            return Err(BatchError::EmptyKey);
        }
        if let Some(queue) = self.payload.queue() {
            if queue.player_id != self.key {
                return Err(BatchError::PayloadMismatch {
                    key: self.key.clone(),
                    player_id: queue.player_id.clone(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn op_type(&self) -> BatchOpType {
        self.payload.op_type()
    }

    #[must_use]
    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            table_name: self.table_name.clone(),
            op_type: self.op_type(),
        }
    }
}

impl BatchableItem for BatchOperation {
    fn key(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constructors_set_type_and_key() {
        let queue = TaskQueue::new("p1");
        assert_eq!(BatchOperation::add("t", &queue, 1).unwrap().op_type(), BatchOpType::Add);
        let remove = BatchOperation::remove("t", "p1", "task-9", 0).unwrap();
        assert_eq!(remove.payload, BatchPayload::Remove { task_id: "task-9".into() });
        assert_eq!(remove.batch_key(), BatchKey { table_name: "t".into(), op_type: BatchOpType::Remove });
    }

    #[test]
    fn test_construction_rejects_malformed() {
        assert_eq!(BatchOperation::delete(" ", "p1", 0).unwrap_err(), BatchError::EmptyTableName);
        assert_eq!(BatchOperation::delete("t", "", 0).unwrap_err(), BatchError::EmptyKey);
        assert!(matches!(BatchOperation::remove("t", "p1", "", 0), Err(BatchError::Malformed(_))));

        let queue = TaskQueue::new("p2");
        let err = BatchOperation::new("t", "p1", BatchPayload::Update { queue: Box::new(queue) }, 0).unwrap_err();
        assert!(matches!(err, BatchError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_wire_format_is_closed() {
        let op = BatchOperation::from_json(json!({
            "id": "6f1c0c5e-0c1e-4f43-9a53-0d3f3f3b6a11",
            "tableName": "task_queues",
            "key": "p1",
            "type": "remove",
            "task_id": "t1",
            "timestamp": 0,
            "priority": 2
        }))
        .unwrap();
        assert_eq!(op.op_type(), BatchOpType::Remove);

        let unknown = BatchOperation::from_json(json!({
            "id": "6f1c0c5e-0c1e-4f43-9a53-0d3f3f3b6a11",
            "tableName": "task_queues",
            "key": "p1",
            "type": "truncate",
            "timestamp": 0,
            "priority": 0
        }));
        assert!(matches!(unknown, Err(BatchError::Malformed(_))));
    }
}
