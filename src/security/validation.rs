// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-action payload validation.
//!
//! Validation collects every field error rather than stopping at the first,
//! and returns a sanitized copy of the payload on success.

use serde_json::{Map, Value};

use super::rate_limit::OperationClass;
use super::sanitize::sanitize_field;
use super::FieldError;
use crate::task::{RewardKind, TaskType};

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_TASK_DURATION_MS: u64 = 24 * 60 * 60 * 1000;
pub const MAX_BATCH_OPERATIONS: usize = 100;
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i64> = -100..=100;

/// Player-facing queue actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueAction {
    AddTask,
    RemoveTask,
    UpdateProgress,
    CompleteTask,
    StopAll,
    Pause,
    Resume,
    GetStatus,
    Batch,
}

impl QueueAction {
    pub const ALL: [QueueAction; 9] = [
        QueueAction::AddTask,
        QueueAction::RemoveTask,
        QueueAction::UpdateProgress,
        QueueAction::CompleteTask,
        QueueAction::StopAll,
        QueueAction::Pause,
        QueueAction::Resume,
        QueueAction::GetStatus,
        QueueAction::Batch,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddTask => "addTask",
            Self::RemoveTask => "removeTask",
            Self::UpdateProgress => "updateTaskProgress",
            Self::CompleteTask => "completeTask",
            Self::StopAll => "stopAllTasks",
            Self::Pause => "pauseQueue",
            Self::Resume => "resumeQueue",
            Self::GetStatus => "getQueueStatus",
            Self::Batch => "batchOperations",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    #[must_use]
    pub fn required_scope(&self) -> &'static str {
        match self {
            Self::GetStatus => "queue:read",
            _ => "queue:write",
        }
    }

    #[must_use]
    pub fn operation_class(&self) -> OperationClass {
        match self {
            Self::GetStatus => OperationClass::Read,
            Self::Batch => OperationClass::Batch,
            _ => OperationClass::Write,
        }
    }
}

/// Operator actions, authorized against the `admin:` scope namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminAction {
    ViewQueue,
    ListQueues,
    ForceStop,
    ResetQueue,
    ViewSecurityStatus,
}

impl AdminAction {
    pub const ALL: [AdminAction; 5] = [
        AdminAction::ViewQueue,
        AdminAction::ListQueues,
        AdminAction::ForceStop,
        AdminAction::ResetQueue,
        AdminAction::ViewSecurityStatus,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewQueue => "viewQueue",
            Self::ListQueues => "listQueues",
            Self::ForceStop => "forceStop",
            Self::ResetQueue => "resetQueue",
            Self::ViewSecurityStatus => "viewSecurityStatus",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    #[must_use]
    pub fn required_scope(&self) -> &'static str {
        match self {
            Self::ViewQueue | Self::ListQueues => "admin:queues:read",
            Self::ForceStop | Self::ResetQueue => "admin:queues:write",
            Self::ViewSecurityStatus => "admin:security:read",
        }
    }

    /// Whether the action targets a single player.
    #[must_use]
    pub fn needs_target(&self) -> bool {
        matches!(self, Self::ViewQueue | Self::ForceStop | Self::ResetQueue)
    }
}

/// Collects field errors while walking one payload.
struct Checker {
    errors: Vec<FieldError>,
    prefix: String,
}

impl Checker {
    fn new(prefix: &str) -> Self {
        Self {
            errors: Vec::new(),
            prefix: prefix.to_string(),
        }
    }

    fn path(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", self.prefix, field)
        }
    }

    fn fail(&mut self, field: &str, message: impl Into<String>) {
        let path = self.path(field);
        self.errors.push(FieldError::new(path, message));
    }

    fn required_str<'a>(&mut self, obj: &'a Map<String, Value>, field: &str, max_len: usize) -> Option<&'a str> {
        match obj.get(field) {
            Some(Value::String(s)) if s.trim().is_empty() => {
                self.fail(field, "must not be empty");
                None
            }
            Some(Value::String(s)) if s.chars().count() > max_len => {
                self.fail(field, format!("must be at most {} characters", max_len));
                None
            }
            Some(Value::String(s)) => Some(s),
            Some(_) => {
                self.fail(field, "must be a string");
                None
            }
            None => {
                self.fail(field, "is required");
                None
            }
        }
    }

    fn optional_str(&mut self, obj: &Map<String, Value>, field: &str, max_len: usize) {
        match obj.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if s.chars().count() > max_len => {
                self.fail(field, format!("must be at most {} characters", max_len));
            }
            Some(Value::String(_)) => {}
            Some(_) => self.fail(field, "must be a string"),
        }
    }

    fn object<'a>(&mut self, value: Option<&'a Value>, field: &str) -> Option<&'a Map<String, Value>> {
        match value {
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                self.fail(field, "must be an object");
                None
            }
            None => {
                self.fail(field, "is required");
                None
            }
        }
    }

    fn task(&mut self, obj: &Map<String, Value>) {
        self.required_str(obj, "id", MAX_ID_LEN);
        self.required_str(obj, "name", MAX_NAME_LEN);

        match obj.get("type") {
            Some(Value::String(s)) if TaskType::parse(s).is_some() => {}
            Some(Value::String(s)) => self.fail("type", format!("unknown task type '{}'", s)),
            Some(_) => self.fail("type", "must be a string"),
            None => self.fail("type", "is required"),
        }

        match obj.get("durationMs").and_then(Value::as_u64) {
            Some(0) => self.fail("durationMs", "must be positive"),
            Some(ms) if ms > MAX_TASK_DURATION_MS => {
                self.fail("durationMs", format!("must be at most {} ms", MAX_TASK_DURATION_MS))
            }
            Some(_) => {}
            None => self.fail("durationMs", "must be a non-negative integer"),
        }

        match obj.get("priority") {
            None | Some(Value::Null) => {}
            Some(v) => match v.as_i64() {
                Some(p) if PRIORITY_RANGE.contains(&p) => {}
                _ => self.fail(
                    "priority",
                    format!("must be an integer in {}..={}", PRIORITY_RANGE.start(), PRIORITY_RANGE.end()),
                ),
            },
        }
    }

    fn progress(&mut self, obj: &Map<String, Value>) {
        match obj.get("progress").and_then(Value::as_f64) {
            Some(p) if (0.0..=1.0).contains(&p) => {}
            Some(_) => self.fail("progress", "must be between 0 and 1"),
            None => self.fail("progress", "must be a number"),
        }
    }

    fn rewards(&mut self, obj: &Map<String, Value>) {
        let rewards = match obj.get("rewards") {
            None | Some(Value::Null) => return,
            Some(Value::Array(items)) => items,
            Some(_) => {
                self.fail("rewards", "must be an array");
                return;
            }
        };
        for (i, reward) in rewards.iter().enumerate() {
            let field = format!("rewards[{}]", i);
            let Some(reward) = reward.as_object() else {
                self.fail(&field, "must be an object");
                continue;
            };
            let kind = reward.get("type").and_then(Value::as_str).and_then(RewardKind::parse);
            if kind.is_none() {
                self.fail(&format!("{}.type", field), "must be one of experience, item, currency");
            }
            if reward.get("amount").and_then(Value::as_u64).is_none() {
                self.fail(&format!("{}.amount", field), "must be a non-negative integer");
            }
            if kind == Some(RewardKind::Item) && reward.get("item_id").and_then(Value::as_str).is_none() {
                self.fail(&format!("{}.item_id", field), "is required for item rewards");
            }
        }
    }
}

/// Validate a player id. Returns the errors found.
pub fn validate_player_id(player_id: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if player_id.trim().is_empty() {
        errors.push(FieldError::new("playerId", "must not be empty"));
    } else if player_id.chars().count() > MAX_ID_LEN {
        errors.push(FieldError::new("playerId", format!("must be at most {} characters", MAX_ID_LEN)));
    } else if player_id.chars().any(|c| c.is_control() || c == '<' || c == '>') {
        errors.push(FieldError::new("playerId", "contains disallowed characters"));
    }
    errors
}

fn check_action(checker: &mut Checker, action: QueueAction, payload: &Value) {
    let empty = Map::new();
    let obj = match payload {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            checker.fail("payload", "must be an object");
            return;
        }
    };

    match action {
        QueueAction::AddTask => {
            if let Some(task) = checker.object(obj.get("task"), "task") {
                let mut nested = Checker::new(&checker.path("task"));
                nested.task(task);
                checker.errors.append(&mut nested.errors);
            }
        }
        QueueAction::RemoveTask => {
            checker.required_str(obj, "taskId", MAX_ID_LEN);
        }
        QueueAction::UpdateProgress => {
            checker.required_str(obj, "taskId", MAX_ID_LEN);
            checker.progress(obj);
        }
        QueueAction::CompleteTask => {
            checker.required_str(obj, "taskId", MAX_ID_LEN);
            checker.rewards(obj);
        }
        QueueAction::Pause => checker.optional_str(obj, "reason", MAX_REASON_LEN),
        QueueAction::StopAll | QueueAction::Resume | QueueAction::GetStatus => {}
        QueueAction::Batch => match obj.get("operations") {
            Some(Value::Array(ops)) if ops.is_empty() => checker.fail("operations", "must not be empty"),
            Some(Value::Array(ops)) if ops.len() > MAX_BATCH_OPERATIONS => {
                checker.fail("operations", format!("must contain at most {} entries", MAX_BATCH_OPERATIONS))
            }
            Some(Value::Array(ops)) => {
                for (i, op) in ops.iter().enumerate() {
                    let mut nested = Checker::new(&checker.path(&format!("operations[{}]", i)));
                    let inner = op.get("action").and_then(Value::as_str).and_then(QueueAction::parse);
                    match inner {
                        Some(a @ (QueueAction::AddTask | QueueAction::RemoveTask | QueueAction::UpdateProgress)) => {
                            check_action(&mut nested, a, op);
                        }
                        _ => nested.fail("action", "must be addTask, removeTask or updateTaskProgress"),
                    }
                    checker.errors.append(&mut nested.errors);
                }
            }
            Some(_) => checker.fail("operations", "must be an array"),
            None => checker.fail("operations", "is required"),
        },
    }
}

/// Sanitize the free-text fields an action carries.
fn sanitize_action(action: QueueAction, payload: &mut Value) {
    match action {
        QueueAction::AddTask => {
            if let Some(name) = payload.pointer_mut("/task/name") {
                sanitize_field(name);
            }
        }
        QueueAction::Pause => {
            if let Some(reason) = payload.get_mut("reason") {
                sanitize_field(reason);
            }
        }
        QueueAction::Batch => {
            if let Some(Value::Array(ops)) = payload.get_mut("operations") {
                for op in ops {
                    if let Some(name) = op.pointer_mut("/task/name") {
                        sanitize_field(name);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Validate `payload` for `action`, returning a sanitized copy.
pub fn validate_payload(action: QueueAction, payload: &Value) -> Result<Value, Vec<FieldError>> {
    let mut checker = Checker::new("");
    check_action(&mut checker, action, payload);
    if !checker.errors.is_empty() {
        return Err(checker.errors);
    }
    let mut sanitized = payload.clone();
    sanitize_action(action, &mut sanitized);
    Ok(sanitized)
}

/// Validate an operator payload, returning a sanitized copy.
///
/// `forceStop` and `resetQueue` may carry a free-text `reason` for the audit
/// trail. Other operator actions take no payload fields.
pub fn validate_admin_payload(action: AdminAction, payload: &Value) -> Result<Value, Vec<FieldError>> {
    let mut checker = Checker::new("");
    match payload {
        Value::Object(obj) => {
            if matches!(action, AdminAction::ForceStop | AdminAction::ResetQueue) {
                checker.optional_str(obj, "reason", MAX_REASON_LEN);
            }
        }
        Value::Null => {}
        _ => checker.fail("payload", "must be an object"),
    }
    if !checker.errors.is_empty() {
        return Err(checker.errors);
    }
    let mut sanitized = payload.clone();
    if let Some(reason) = sanitized.get_mut("reason") {
        sanitize_field(reason);
    }
    Ok(sanitized)
}
