// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic task-queue-engine usage example.
//!
//! Demonstrates:
//! 1. Starting the service (in-memory by default, Redis/SQL when configured)
//! 2. Admitting a request through the security middleware
//! 3. Queueing tasks, reporting progress, completing them
//! 4. Reading status, cache and coalescer statistics
//! 5. Displaying captured metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//!
//! # Against real backends
//! REDIS_URL=redis://localhost:6379 SQL_URL="sqlite://demo.db?mode=rwc" cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tokio::sync::watch;

use task_queue_engine::security::StaticTokenValidator;
use task_queue_engine::task::epoch_millis;
use task_queue_engine::{
    RequestContext, Reward, SecurityMiddleware, ServiceState, Task, TaskEngineConfig, TaskQueueService, TaskType,
    TokenClaims,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║         task-queue-engine: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the service
    // ─────────────────────────────────────────────────────────────────────────
    let config = TaskEngineConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: Some("demo:".into()),
        sql_url: std::env::var("SQL_URL").ok(),
        // Flush quickly for the demo
        batch_max_size: 4,
        batch_timeout_ms: 500,
        progress_debounce_ms: 250,
        ..Default::default()
    };
    println!("📦 Backends: store={} cache={}",
        config.sql_url.as_deref().unwrap_or("in-memory"),
        config.redis_url.as_deref().unwrap_or("local only"));

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let service = Arc::new(TaskQueueService::new(config.clone(), config_rx));
    service.start().await?;
    assert_eq!(service.state(), ServiceState::Ready);

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };
    println!("   ✅ Service running");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Admit a request through the security middleware
    // ─────────────────────────────────────────────────────────────────────────
    let tokens = Arc::new(StaticTokenValidator::new());
    tokens.insert("demo-token", TokenClaims::new("alice", &["queue:*"], epoch_millis() + 3_600_000));
    let security = SecurityMiddleware::new(tokens, &config);

    let payload = json!({"task": {
        "id": "oak-1", "type": "harvesting", "name": "Chop <b>oak</b>", "durationMs": 30000, "priority": 5
    }});
    let request = security.validate_operation("addTask", "alice", &payload, &RequestContext::bearer("demo-token"))?;
    let first: Task = serde_json::from_value(request.payload["task"].clone())?;
    println!("\n🔐 Admitted '{}' for {} (sanitized name: {:?})", request.action, request.identity, first.name);

    let denied = security.validate_operation("addTask", "alice", &payload, &RequestContext::bearer("forged"));
    if let Err(e) = denied {
        println!("   └─ Forged token rejected with {}: {}", e.status_code(), e);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Queue, progress and complete
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Queueing tasks...");
    let outcome = service.add_task("alice", first).await?;
    println!("   └─ oak-1 → {:?}", outcome);
    let outcome = service
        .add_task("alice", Task::new("ingot-1", TaskType::Crafting, "Smelt iron", 45_000))
        .await?;
    println!("   └─ ingot-1 → {:?}", outcome);

    for progress in [0.1, 0.2, 0.25, 0.6, 1.0] {
        let outcome = service.update_task_progress("alice", "oak-1", progress).await?;
        println!("   └─ progress {:.2} → {:?}", progress, outcome);
    }

    let (done, outcome) = service
        .complete_task("alice", "oak-1", vec![Reward::experience(50), Reward::item("oak_log", 3)])
        .await?;
    println!("   └─ completed '{}' → {:?}", done.name, outcome);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Status and statistics
    // ─────────────────────────────────────────────────────────────────────────
    let status = service.get_queue_status("alice").await?;
    println!("\n📊 Queue status:\n{}", serde_json::to_string_pretty(&status)?);

    let version = service.ensure_durable("alice").await?;
    println!("\n💾 Durable at version {:?}", version);

    let cache = service.cache_stats();
    println!("   ┌─ Cache: hits={} misses={} hit_rate={:.2} local_entries={}",
        cache.hits, cache.misses, cache.hit_rate, cache.local_entries);
    let coalescer = service.coalescer_stats();
    println!("   ├─ Coalescer: flushed={} failed={} pending={}",
        coalescer.operations_flushed, coalescer.operations_failed, coalescer.pending_operations);
    let pool = service.pool_stats().await;
    println!("   └─ Pool: handles={} created={}", pool.total, pool.created);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    let report = service.shutdown().await;
    runner.await?;
    println!("   ✅ {:?} (state: {})", report, service.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let labels = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => format!("{} (counter)", v),
            DebugValue::Gauge(v) => format!("{:.2} (gauge)", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} sum={:.4} (histogram)", samples.len(), sum)
            }
        };
        lines.push(format!("{}{} = {}", key.name(), labels, rendered));
    }
    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
