// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-window rate limiting keyed by `(identity, operation class)`.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::TaskEngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Batch,
    Admin,
}

impl OperationClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Batch => "batch",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    max_requests: u32,
    window: Duration,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Checks between two sweeps of elapsed windows.
pub const DEFAULT_PRUNE_INTERVAL: u64 = 1024;

pub struct RateLimiter {
    rules: HashMap<OperationClass, Rule>,
    windows: DashMap<(String, OperationClass), Window>,
    checks: AtomicU64,
    prune_interval: u64,
}

impl RateLimiter {
    /// Limiter with no rules: every class is unlimited until one is added.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }

    #[must_use]
    pub fn from_config(config: &TaskEngineConfig) -> Self {
        let mut limiter = Self::new();
        for (class, rule) in [
            (OperationClass::Read, config.rate_limit_read),
            (OperationClass::Write, config.rate_limit_write),
            (OperationClass::Batch, config.rate_limit_batch),
            (OperationClass::Admin, config.rate_limit_admin),
        ] {
            limiter = limiter.with_rule(class, rule.max_requests, rule.window());
        }
        limiter
    }

    #[must_use]
    pub fn with_rule(mut self, class: OperationClass, max_requests: u32, window: Duration) -> Self {
        self.rules.insert(class, Rule { max_requests, window });
        self
    }

    /// Sweep elapsed windows every `checks` calls to [`check`](Self::check).
    #[must_use]
    pub fn with_prune_interval(mut self, checks: u64) -> Self {
        self.prune_interval = checks.max(1);
        self
    }

    /// Count one request. `Err` carries how long until the window resets.
    ///
    /// Every `prune_interval` calls the elapsed windows of all identities are
    /// dropped first, so the map only holds identities seen recently.
    pub fn check(&self, identity: &str, class: OperationClass) -> Result<(), Duration> {
        let Some(rule) = self.rules.get(&class).copied() else {
            return Ok(());
        };
        // Must run before `entry` takes a shard lock that `retain` would need.
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % self.prune_interval == 0 {
            let dropped = self.prune();
            if dropped > 0 {
                debug!(dropped, "Rate-limit windows pruned");
            }
        }
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((identity.to_string(), class))
            .or_insert_with(|| Window { started: now, count: 0 });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= rule.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= rule.max_requests {
            let remaining = rule.window.saturating_sub(now.saturating_duration_since(window.started));
            return Err(remaining.max(Duration::from_millis(1)));
        }
        window.count += 1;
        Ok(())
    }

    /// Requests left in the current window, if the class is limited.
    #[must_use]
    pub fn remaining(&self, identity: &str, class: OperationClass) -> Option<u32> {
        let rule = self.rules.get(&class)?;
        let used = self
            .windows
            .get(&(identity.to_string(), class))
            .filter(|w| w.started.elapsed() < rule.window)
            .map(|w| w.count)
            .unwrap_or(0);
        Some(rule.max_requests.saturating_sub(used))
    }

    /// Drop windows that have fully elapsed. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let before = self.windows.len();
        self.windows.retain(|(_, class), window| {
            self.rules
                .get(class)
                .map(|rule| window.started.elapsed() < rule.window)
                .unwrap_or(false)
        });
        before.saturating_sub(self.windows.len())
    }

    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
