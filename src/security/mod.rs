// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request admission for queue mutations.
//!
//! Every request passes the same pipeline before it reaches the engine:
//!
//! ```text
//! Authenticate → Authorize (scope) → RateLimit → Validate/Sanitize → dispatch
//! ```
//!
//! Rejections carry an HTTP-style status via [`SecurityError::status_code`]
//! so request glue can map them without inspecting variants.

pub mod middleware;
pub mod rate_limit;
pub mod sanitize;
pub mod token;
pub mod validation;

use std::time::Duration;
use serde::Serialize;
use thiserror::Error;

pub use middleware::{RequestContext, SecurityAlert, SecurityEventKind, SecurityMiddleware, SecurityStatus, ValidatedRequest};
pub use rate_limit::{OperationClass, RateLimiter};
pub use sanitize::sanitize_text;
pub use token::{HmacTokenValidator, StaticTokenValidator, TokenClaims, TokenError, TokenValidator};
pub use validation::{AdminAction, QueueAction};

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },
    #[error("validation failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ValidationFailed(Vec<FieldError>),
    /// Internal details are logged, never returned
    #[error("internal error")]
    InternalError,
}

impl SecurityError {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AuthenticationFailed(_) => 401,
            Self::Forbidden(_) => 403,
            Self::RateLimitExceeded { .. } => 429,
            Self::ValidationFailed(_) => 400,
            Self::InternalError => 500,
        }
    }
}
