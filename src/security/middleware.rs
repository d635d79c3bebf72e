// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Admission pipeline for player and operator requests.
//!
//! Player requests that fail authentication or lack the required scope are
//! both rejected as 401. Operator requests go through the `admin:` scope
//! namespace and a separate rate-limit bucket, and surface every
//! authentication or scope failure as 403.
//!
//! Every rejection is counted and appended to a bounded alert list exposed
//! through [`SecurityMiddleware::get_security_status`].

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::rate_limit::{OperationClass, RateLimiter};
use super::token::{TokenClaims, TokenError, TokenValidator};
use super::validation::{self, AdminAction, QueueAction};
use super::{FieldError, SecurityError};
use crate::config::TaskEngineConfig;
use crate::task::epoch_millis;

/// Caller-supplied request metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Bearer token, without the `Bearer ` prefix
    pub token: Option<String>,
    /// Caller address, for alerts only
    pub source: Option<String>,
}

impl RequestContext {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            source: None,
        }
    }
}

/// A request that passed every check. `payload` is the sanitized copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub action: String,
    pub player_id: Option<String>,
    pub identity: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    AuthenticationFailure,
    AuthorizationFailure,
    RateLimitViolation,
    ValidationFailure,
    InternalError,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub timestamp: i64,
    pub kind: SecurityEventKind,
    pub action: String,
    pub player_id: Option<String>,
    pub source: Option<String>,
    pub detail: String,
}

/// Rolling counters for external monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    pub total_events: u64,
    pub failed_operations: u64,
    pub authentication_failures: u64,
    pub authorization_failures: u64,
    pub validation_failures: u64,
    pub rate_limit_violations: u64,
    pub internal_errors: u64,
    pub recent_alerts: Vec<SecurityAlert>,
}

#[derive(Default)]
struct Counters {
    total_events: AtomicU64,
    failed_operations: AtomicU64,
    authentication_failures: AtomicU64,
    authorization_failures: AtomicU64,
    validation_failures: AtomicU64,
    rate_limit_violations: AtomicU64,
    internal_errors: AtomicU64,
}

pub struct SecurityMiddleware {
    validator: Arc<dyn TokenValidator>,
    limiter: RateLimiter,
    admin_limiter: RateLimiter,
    counters: Counters,
    alerts: Mutex<VecDeque<SecurityAlert>>,
    max_alerts: usize,
}

impl SecurityMiddleware {
    pub fn new(validator: Arc<dyn TokenValidator>, config: &TaskEngineConfig) -> Self {
        let admin_rule = config.rate_limit_admin;
        Self::with_limiters(
            validator,
            RateLimiter::from_config(config),
            RateLimiter::new().with_rule(OperationClass::Admin, admin_rule.max_requests, admin_rule.window()),
            config.max_recent_alerts,
        )
    }

    pub fn with_limiters(
        validator: Arc<dyn TokenValidator>,
        limiter: RateLimiter,
        admin_limiter: RateLimiter,
        max_alerts: usize,
    ) -> Self {
        Self {
            validator,
            limiter,
            admin_limiter,
            counters: Counters::default(),
            alerts: Mutex::new(VecDeque::new()),
            max_alerts: max_alerts.max(1),
        }
    }

    /// Admit a player request: authenticate, check scope, rate limit, then
    /// validate and sanitize the payload.
    pub fn validate_operation(
        &self,
        action: &str,
        player_id: &str,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<ValidatedRequest, SecurityError> {
        self.guarded(action, Some(player_id), ctx, || self.player_pipeline(action, player_id, payload, ctx))
    }

    /// Admit an operator request against the `admin:` namespace.
    pub fn validate_admin_operation(
        &self,
        action: &str,
        target_player: Option<&str>,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<ValidatedRequest, SecurityError> {
        self.guarded(action, target_player, ctx, || self.admin_pipeline(action, target_player, payload, ctx))
    }

    /// Contain panics from validator backends as `InternalError`.
    fn guarded<F>(
        &self,
        action: &str,
        player_id: Option<&str>,
        ctx: &RequestContext,
        f: F,
    ) -> Result<ValidatedRequest, SecurityError>
    where
        F: FnOnce() -> Result<ValidatedRequest, SecurityError>,
    {
        self.counters.total_events.fetch_add(1, Ordering::Relaxed);
        let result = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(_) => {
                error!(action, "Security validation panicked");
                Err(SecurityError::InternalError)
            }
        };
        if let Err(err) = &result {
            self.record_rejection(action, player_id, ctx, err);
        }
        result
    }

    fn authenticate(&self, ctx: &RequestContext) -> Result<TokenClaims, (SecurityEventKind, String)> {
        let token = ctx
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or((SecurityEventKind::AuthenticationFailure, "missing bearer token".to_string()))?;
        self.validator.validate(token).map_err(|e| match e {
            TokenError::Unavailable(reason) => (SecurityEventKind::InternalError, reason),
            other => (SecurityEventKind::AuthenticationFailure, other.to_string()),
        })
    }

    fn player_pipeline(
        &self,
        action_name: &str,
        player_id: &str,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<ValidatedRequest, SecurityError> {
        let claims = self.authenticate(ctx).map_err(|(kind, reason)| match kind {
            SecurityEventKind::InternalError => {
                error!(reason = %reason, "Token validator failure");
                SecurityError::InternalError
            }
            _ => SecurityError::AuthenticationFailed(reason),
        })?;

        let action = QueueAction::parse(action_name)
            .ok_or_else(|| SecurityError::ValidationFailed(vec![FieldError::new("action", "unknown action")]))?;

        if !claims.has_scope(action.required_scope()) {
            return Err(SecurityError::AuthenticationFailed(format!(
                "token lacks scope '{}'",
                action.required_scope()
            )));
        }
        if claims.sub != player_id {
            return Err(SecurityError::AuthenticationFailed(
                "token subject does not match player".to_string(),
            ));
        }

        self.limiter
            .check(&claims.sub, action.operation_class())
            .map_err(|retry_after| SecurityError::RateLimitExceeded { retry_after })?;

        let mut errors = validation::validate_player_id(player_id);
        let sanitized = match validation::validate_payload(action, payload) {
            Ok(value) => Some(value),
            Err(mut payload_errors) => {
                errors.append(&mut payload_errors);
                None
            }
        };
        let payload = match sanitized {
            Some(value) if errors.is_empty() => value,
            _ => return Err(SecurityError::ValidationFailed(errors)),
        };

        debug!(action = action.as_str(), player_id, "Request admitted");
        Ok(ValidatedRequest {
            action: action.as_str().to_string(),
            player_id: Some(player_id.to_string()),
            identity: claims.sub,
            payload,
        })
    }

    fn admin_pipeline(
        &self,
        action_name: &str,
        target_player: Option<&str>,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<ValidatedRequest, SecurityError> {
        let claims = self.authenticate(ctx).map_err(|(kind, reason)| match kind {
            SecurityEventKind::InternalError => {
                error!(reason = %reason, "Token validator failure");
                SecurityError::InternalError
            }
            _ => SecurityError::Forbidden(reason),
        })?;

        let action = AdminAction::parse(action_name)
            .ok_or_else(|| SecurityError::ValidationFailed(vec![FieldError::new("action", "unknown admin action")]))?;

        if !claims.has_scope(action.required_scope()) {
            return Err(SecurityError::Forbidden(format!(
                "token lacks scope '{}'",
                action.required_scope()
            )));
        }

        self.admin_limiter
            .check(&claims.sub, OperationClass::Admin)
            .map_err(|retry_after| SecurityError::RateLimitExceeded { retry_after })?;

        let (player_id, mut errors) = match (action.needs_target(), target_player) {
            (true, Some(player)) => (Some(player.to_string()), validation::validate_player_id(player)),
            (true, None) => (None, vec![FieldError::new("playerId", "is required")]),
            (false, _) => (None, Vec::new()),
        };
        let payload = match validation::validate_admin_payload(action, payload) {
            Ok(value) if errors.is_empty() => value,
            Ok(_) => return Err(SecurityError::ValidationFailed(errors)),
            Err(mut payload_errors) => {
                errors.append(&mut payload_errors);
                return Err(SecurityError::ValidationFailed(errors));
            }
        };

        warn!(action = action.as_str(), operator = %claims.sub, target = ?player_id, "Admin operation admitted");
        Ok(ValidatedRequest {
            action: action.as_str().to_string(),
            player_id,
            identity: claims.sub,
            payload,
        })
    }

    fn record_rejection(&self, action: &str, player_id: Option<&str>, ctx: &RequestContext, err: &SecurityError) {
        let (kind, counter) = match err {
            SecurityError::AuthenticationFailed(_) => {
                (SecurityEventKind::AuthenticationFailure, &self.counters.authentication_failures)
            }
            SecurityError::Forbidden(_) => (SecurityEventKind::AuthorizationFailure, &self.counters.authorization_failures),
            SecurityError::RateLimitExceeded { .. } => {
                (SecurityEventKind::RateLimitViolation, &self.counters.rate_limit_violations)
            }
            SecurityError::ValidationFailed(_) => (SecurityEventKind::ValidationFailure, &self.counters.validation_failures),
            SecurityError::InternalError => (SecurityEventKind::InternalError, &self.counters.internal_errors),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.counters.failed_operations.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_security_event(kind_label(kind));

        debug!(action, kind = kind_label(kind), error = %err, "Request rejected");

        let mut alerts = self.alerts.lock();
        if alerts.len() >= self.max_alerts {
            alerts.pop_front();
        }
        alerts.push_back(SecurityAlert {
            timestamp: epoch_millis(),
            kind,
            action: action.to_string(),
            player_id: player_id.map(String::from),
            source: ctx.source.clone(),
            detail: err.to_string(),
        });
    }

    /// Snapshot of rejection counters and recent alerts.
    #[must_use]
    pub fn get_security_status(&self) -> SecurityStatus {
        let c = &self.counters;
        SecurityStatus {
            total_events: c.total_events.load(Ordering::Relaxed),
            failed_operations: c.failed_operations.load(Ordering::Relaxed),
            authentication_failures: c.authentication_failures.load(Ordering::Relaxed),
            authorization_failures: c.authorization_failures.load(Ordering::Relaxed),
            validation_failures: c.validation_failures.load(Ordering::Relaxed),
            rate_limit_violations: c.rate_limit_violations.load(Ordering::Relaxed),
            internal_errors: c.internal_errors.load(Ordering::Relaxed),
            recent_alerts: self.alerts.lock().iter().cloned().collect(),
        }
    }

    /// Periodic housekeeping for rate-limit windows.
    pub fn prune(&self) -> usize {
        self.limiter.prune() + self.admin_limiter.prune()
    }
}

fn kind_label(kind: SecurityEventKind) -> &'static str {
    match kind {
        SecurityEventKind::AuthenticationFailure => "authentication_failure",
        SecurityEventKind::AuthorizationFailure => "authorization_failure",
        SecurityEventKind::RateLimitViolation => "rate_limit_violation",
        SecurityEventKind::ValidationFailure => "validation_failure",
        SecurityEventKind::InternalError => "internal_error",
    }
}
