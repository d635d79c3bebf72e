// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Counters, gauges and histograms emitted by the engine.
//!
//! Everything goes through the `metrics` facade; the embedding process
//! installs whatever recorder it exports with. Names carry the
//! `task_engine_` prefix, counters end in `_total` and durations in
//! `_seconds`.
//!
//! | label       | values                                        |
//! |-------------|-----------------------------------------------|
//! | `tier`      | `store`, `cache`, `service`                   |
//! | `operation` | `load`, `save`, `add_task`, `complete_task`.. |
//! | `status`    | `success`, `hit`, `miss`, `conflict`, `error` |

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::coordinator::ServiceState;
use crate::resilience::circuit_breaker::CircuitState;

pub fn record_operation(tier: &str, operation: &str, status: &str) {
    let labels = [
        ("tier", tier.to_string()),
        ("operation", operation.to_string()),
        ("status", status.to_string()),
    ];
    counter!("task_engine_operations_total", &labels).increment(1);
}

pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    let labels = [("tier", tier.to_string()), ("operation", operation.to_string())];
    histogram!("task_engine_operation_seconds", &labels).record(duration.as_secs_f64());
}

/// A stored queue whose checksum did not match its contents.
pub fn record_corruption(table: &str) {
    counter!("task_engine_corruption_detected_total", "table" => table.to_string()).increment(1);
}

/// A resident queue that failed `validate_queue_integrity`.
pub fn record_integrity_failure(table: &str) {
    counter!("task_engine_integrity_failures_total", "table" => table.to_string()).increment(1);
}

// cache

pub fn record_cache_access(class: &str, outcome: &str) {
    let labels = [("class", class.to_string()), ("outcome", outcome.to_string())];
    counter!("task_engine_cache_access_total", &labels).increment(1);
}

/// The remote tier was skipped or failed and the local tier answered.
pub fn record_cache_fallback(operation: &str) {
    counter!("task_engine_cache_fallback_total", "operation" => operation.to_string()).increment(1);
}

pub fn record_cache_cleanup(kind: &str, count: usize) {
    counter!("task_engine_cache_cleanup_total", "kind" => kind.to_string()).increment(count as u64);
}

pub fn set_local_cache_entries(count: usize) {
    gauge!("task_engine_local_cache_entries").set(count as f64);
}

pub fn set_local_cache_bytes(bytes: usize) {
    gauge!("task_engine_local_cache_bytes").set(bytes as f64);
}

/// Local tier fill ratio in `0.0..=1.0`.
pub fn set_memory_pressure(pressure: f64) {
    gauge!("task_engine_memory_pressure").set(pressure);
}

// batching

pub fn set_batch_pending(count: usize) {
    gauge!("task_engine_batch_pending").set(count as f64);
}

pub fn record_batch_flush(op_type: &str, reason: &str, count: usize, duration: Duration) {
    let by_op = [("op_type", op_type.to_string())];
    let by_reason = [("op_type", op_type.to_string()), ("reason", reason.to_string())];
    counter!("task_engine_batch_flushes_total", &by_reason).increment(1);
    histogram!("task_engine_batch_size", &by_op).record(count as f64);
    histogram!("task_engine_batch_flush_seconds", &by_op).record(duration.as_secs_f64());
}

pub fn record_batch_operation_failure(table: &str, op_type: &str) {
    let labels = [("table", table.to_string()), ("op_type", op_type.to_string())];
    counter!("task_engine_batch_operation_failures_total", &labels).increment(1);
}

/// `mode` is `immediate` for milestones and `debounced` otherwise.
pub fn record_progress_persist(mode: &str) {
    counter!("task_engine_progress_updates_total", "mode" => mode.to_string()).increment(1);
}

// pool and resilience

pub fn set_pool_size(count: usize) {
    gauge!("task_engine_pool_handles").set(count as f64);
}

pub fn set_circuit_state(circuit: &str, state: CircuitState) {
    gauge!("task_engine_circuit_breaker_state", "circuit" => circuit.to_string()).set(f64::from(state as u8));
}

pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    let labels = [("circuit", circuit.to_string()), ("outcome", outcome.to_string())];
    counter!("task_engine_circuit_breaker_calls_total", &labels).increment(1);
}

// security

pub fn record_security_event(kind: &str) {
    counter!("task_engine_security_events_total", "kind" => kind.to_string()).increment(1);
}

// service

pub fn set_active_queues(count: usize) {
    gauge!("task_engine_active_queues").set(count as f64);
}

/// Lifecycle position as a gauge, `Created` = 0 through `Stopped` = 5.
pub fn set_service_state(state: ServiceState) {
    let ordinal: u8 = match state {
        ServiceState::Created => 0,
        ServiceState::Starting => 1,
        ServiceState::Ready => 2,
        ServiceState::Running => 3,
        ServiceState::ShuttingDown => 4,
        ServiceState::Stopped => 5,
    };
    gauge!("task_engine_service_state").set(f64::from(ordinal));
}

pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!("task_engine_startup_phase_seconds", "phase" => phase.to_string()).record(duration.as_secs_f64());
}

/// Records `task_engine_operation_seconds` for its scope when dropped.
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    started: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            started: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::MetricKind;

    /// Run `f` against a thread-local recorder and return what it captured.
    fn capture(f: impl FnOnce()) -> Vec<(MetricKind, String, Vec<(String, String)>, DebugValue)> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(composite, _, _, value)| {
                let (kind, key) = composite.into_parts();
                let labels = key.labels().map(|l| (l.key().to_string(), l.value().to_string())).collect();
                (kind, key.name().to_string(), labels, value)
            })
            .collect()
    }

    fn counter_value(captured: &[(MetricKind, String, Vec<(String, String)>, DebugValue)], name: &str) -> u64 {
        captured
            .iter()
            .filter(|(_, n, _, _)| n == name)
            .map(|(_, _, _, v)| match v {
                DebugValue::Counter(c) => *c,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn operations_are_labelled_by_tier_and_status() {
        let captured = capture(|| {
            record_operation("store", "save", "conflict");
            record_operation("store", "save", "conflict");
            record_operation("service", "add_task", "success");
        });

        assert_eq!(counter_value(&captured, "task_engine_operations_total"), 3);
        let conflict = captured
            .iter()
            .find(|(_, _, labels, _)| labels.contains(&("status".into(), "conflict".into())))
            .unwrap();
        assert!(matches!(conflict.3, DebugValue::Counter(2)));
        assert!(conflict.2.contains(&("tier".into(), "store".into())));
    }

    #[test]
    fn batch_flush_emits_count_size_and_duration() {
        let captured = capture(|| record_batch_flush("update", "count", 25, Duration::from_millis(3)));

        assert_eq!(counter_value(&captured, "task_engine_batch_flushes_total"), 1);
        let size = captured.iter().find(|(_, n, _, _)| n == "task_engine_batch_size").unwrap();
        match &size.3 {
            DebugValue::Histogram(samples) => assert_eq!(samples[0].into_inner(), 25.0),
            other => panic!("expected histogram, got {other:?}"),
        }
        assert!(captured.iter().any(|(_, n, _, _)| n == "task_engine_batch_flush_seconds"));
    }

    #[test]
    fn circuit_and_service_state_gauges_use_ordinals() {
        let captured = capture(|| {
            set_circuit_state("remote_cache", CircuitState::Open);
            set_service_state(ServiceState::Running);
        });

        let gauge = |name: &str| {
            captured
                .iter()
                .find(|(_, n, _, _)| n == name)
                .map(|(_, _, _, v)| match v {
                    DebugValue::Gauge(g) => g.into_inner(),
                    _ => f64::NAN,
                })
                .unwrap()
        };
        assert_eq!(gauge("task_engine_circuit_breaker_state"), 2.0);
        assert_eq!(gauge("task_engine_service_state"), 3.0);
    }

    #[test]
    fn cache_cleanup_counts_removed_entries() {
        let captured = capture(|| {
            record_cache_cleanup("sweep", 12);
            record_cache_cleanup("sweep", 3);
        });
        assert_eq!(counter_value(&captured, "task_engine_cache_cleanup_total"), 15);
    }

    #[test]
    fn latency_timer_records_on_drop() {
        let captured = capture(|| {
            let _timer = LatencyTimer::new("store", "load");
        });
        let (kind, _, labels, _) = captured
            .iter()
            .find(|(_, n, _, _)| n == "task_engine_operation_seconds")
            .unwrap();
        assert_eq!(*kind, MetricKind::Histogram);
        assert!(labels.contains(&("operation".into(), "load".into())));
    }

    #[test]
    fn helpers_are_noops_without_a_recorder() {
        record_progress_persist("debounced");
        record_security_event("rate_limit_violation");
        set_memory_pressure(0.75);
    }
}
