// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote cache tests against a real Redis.
//!
//! Uses testcontainers, so Docker must be available.
//!
//! # Running Tests
//! ```bash
//! cargo test --test redis_integration -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use task_queue_engine::cache::tiered::queue_key;
use task_queue_engine::pool::SharedStoreConnector;
use task_queue_engine::storage::memory::InMemoryStore;
use task_queue_engine::storage::redis::RedisCache;
use task_queue_engine::{
    RemoteCache, ServiceBackends, ServiceState, Task, TaskEngineConfig, TaskQueueService, TaskType,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_set_get_delete_with_prefix() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = RedisCache::with_prefix(&redis_url(&redis), Some("test:")).await.unwrap();

    cache.ping().await.unwrap();
    cache.set("queue:p1", "{\"v\":1}", Duration::from_secs(30)).await.unwrap();
    assert_eq!(cache.get("queue:p1").await.unwrap().as_deref(), Some("{\"v\":1}"));

    // The prefix keeps a differently-namespaced client from seeing it
    let other = RedisCache::with_prefix(&redis_url(&redis), Some("other:")).await.unwrap();
    assert!(other.get("queue:p1").await.unwrap().is_none());

    cache.delete("queue:p1").await.unwrap();
    assert!(cache.get("queue:p1").await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_entries_expire_with_ttl() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = RedisCache::new(&redis_url(&redis)).await.unwrap();

    cache.set("progress:p1:a", "0.5", Duration::from_secs(1)).await.unwrap();
    assert!(cache.get("progress:p1:a").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert!(cache.get("progress:p1:a").await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_service_writes_through_remote_tier() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = redis_url(&redis);

    let config = TaskEngineConfig {
        redis_url: Some(url.clone()),
        redis_prefix: Some("svc:".into()),
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(config.clone());
    let service = TaskQueueService::with_backends(
        config,
        rx,
        ServiceBackends {
            connector: Some(Arc::new(SharedStoreConnector::new(Arc::new(InMemoryStore::new())))),
            ..Default::default()
        },
    );
    service.start().await.unwrap();
    assert_eq!(service.state(), ServiceState::Ready);
    assert!(service.cache_stats().remote_configured);

    service
        .add_task("p1", Task::new("a", TaskType::Crafting, "Brew potion", 10_000))
        .await
        .unwrap();

    let observer = RedisCache::with_prefix(&url, Some("svc:")).await.unwrap();
    let raw = observer.get(&queue_key("p1")).await.unwrap().expect("queue cached in redis");
    assert!(raw.contains("Brew potion"));

    service.shutdown().await;
    assert!(!service.cache_stats().remote_configured);
}
