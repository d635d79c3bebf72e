// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Breaker in front of the remote cache tier.
//!
//! A dead Redis must not cost every queue read a network timeout. After
//! `failure_threshold` consecutive errors the breaker trips and the tiered
//! cache answers from its local tier until `recovery_timeout` has passed, at
//! which point a probe call is let through. `recloser` makes the admission
//! decision; this wrapper keeps the counters the service reports in
//! [`CacheStats`](crate::cache::CacheStats) and the `remote_cache` gauges.

use parking_lot::Mutex;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Externally visible breaker position. The discriminants are the gauge values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Short-circuited without touching the remote.
    #[error("remote call skipped, breaker is open")]
    Rejected,

    #[error("remote call failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => Self::Rejected,
            RecloserError::Inner(e) => Self::Inner(e),
        }
    }
}

/// Trip and recovery thresholds.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    /// Probe calls that must succeed while half-open.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::remote_cache()
    }
}

impl CircuitConfig {
    /// Settings for the remote cache: five strikes, probe again after 15s.
    #[must_use]
    pub fn remote_cache() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    calls: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Tally {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct Trip {
    streak: u32,
    tripped_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    gate: AsyncRecloser,
    config: CircuitConfig,
    trip: Mutex<Trip>,
    tally: Tally,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let gate = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build()
            .into();

        Self {
            name: name.into(),
            gate,
            config,
            trip: Mutex::new(Trip::default()),
            tally: Tally::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open until the recovery timeout elapses, then half-open until a call succeeds.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let trip = self.trip.lock();
        match trip.tripped_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() < self.config.recovery_timeout => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// Run `op` unless the breaker is open. A rejected call never polls the future.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Tally::bump(&self.tally.calls);
        let outcome = self.gate.call(op()).await;

        let label = match &outcome {
            Ok(_) => {
                Tally::bump(&self.tally.ok);
                self.on_success();
                "success"
            }
            Err(RecloserError::Rejected) => {
                Tally::bump(&self.tally.skipped);
                self.trip.lock().tripped_at.get_or_insert_with(Instant::now);
                debug!(circuit = %self.name, "Remote call skipped, breaker open");
                "rejected"
            }
            Err(RecloserError::Inner(_)) => {
                Tally::bump(&self.tally.failed);
                self.on_failure();
                "failure"
            }
        };
        crate::metrics::record_circuit_breaker_call(&self.name, label);

        outcome.map_err(CircuitError::from)
    }

    fn on_success(&self) {
        let mut trip = self.trip.lock();
        trip.streak = 0;
        if trip.tripped_at.take().is_some() {
            debug!(circuit = %self.name, "Probe succeeded, breaker closed");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
        }
    }

    fn on_failure(&self) {
        let mut trip = self.trip.lock();
        trip.streak = trip.streak.saturating_add(1);
        if trip.streak < self.config.failure_threshold {
            return;
        }
        if trip.tripped_at.is_none() {
            warn!(circuit = %self.name, failures = trip.streak, "Breaker tripped, remote calls suspended");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
        }
        // A failed probe restarts the recovery window.
        trip.tripped_at = Some(Instant::now());
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.tally.calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.tally.ok.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.tally.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.tally.skipped.load(Ordering::Relaxed)
    }

    /// Share of all guarded calls that returned an error, rejections excluded.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        match self.calls_total() {
            0 => 0.0,
            total => self.failures() as f64 / total as f64,
        }
    }
}
