//! Helper-container cache behavior against the scripted runtime.

mod support;

use std::time::Duration;

use uuid::Uuid;

use dockhand_engine::helper::{HelperContainers, HelperKey, HelperMode};
use support::MockRuntime;

fn key(volume: &str, mode: HelperMode, environment: Uuid) -> HelperKey {
    HelperKey {
        volume: volume.to_string(),
        mode,
        environment,
    }
}

#[tokio::test]
async fn test_one_helper_per_key_with_reuse() {
    let runtime = MockRuntime::new();
    let helpers = HelperContainers::new(runtime.clone());
    let environment = Uuid::new_v4();

    let first = helpers
        .acquire(key("data", HelperMode::Read, environment))
        .await
        .unwrap();
    let second = helpers
        .acquire(key("data", HelperMode::Read, environment))
        .await
        .unwrap();

    assert_eq!(first.container_id, second.container_id);
    assert_eq!(runtime.calls_matching("create_container:").await, 1);
    assert_eq!(helpers.len().await, 1);

    // The helper is started and mounts the volume read-only.
    let body = runtime.last_create_body.lock().await.clone().unwrap();
    let binds = body.host_config.binds.unwrap();
    assert_eq!(binds, vec!["data:/dockhand/volume:ro".to_string()]);
    assert_eq!(runtime.calls_matching("start_container:").await, 1);
}

#[tokio::test]
async fn test_mode_and_volume_are_distinct_keys() {
    let runtime = MockRuntime::new();
    let helpers = HelperContainers::new(runtime.clone());
    let environment = Uuid::new_v4();

    let read = helpers
        .acquire(key("data", HelperMode::Read, environment))
        .await
        .unwrap();
    let write = helpers
        .acquire(key("data", HelperMode::Write, environment))
        .await
        .unwrap();
    let other = helpers
        .acquire(key("other", HelperMode::Read, environment))
        .await
        .unwrap();

    assert_ne!(read.container_id, write.container_id);
    assert_ne!(read.container_id, other.container_id);
    assert_eq!(helpers.len().await, 3);

    // Write-mode helpers mount read-write.
    let body = runtime.last_create_body.lock().await.clone();
    assert!(body.is_some());
}

#[tokio::test]
async fn test_sweep_expires_and_removes_container() {
    let runtime = MockRuntime::new();
    let helpers = HelperContainers::with_settings(
        runtime.clone(),
        "busybox:stable".to_string(),
        Duration::from_millis(10),
    );
    let environment = Uuid::new_v4();

    let record = helpers
        .acquire(key("data", HelperMode::Read, environment))
        .await
        .unwrap();
    assert!(runtime
        .containers
        .lock()
        .await
        .contains_key(&record.container_id));

    tokio::time::sleep(Duration::from_millis(20)).await;
    helpers.sweep().await;

    assert_eq!(helpers.len().await, 0);
    assert!(!runtime
        .containers
        .lock()
        .await
        .contains_key(&record.container_id));
}

#[tokio::test]
async fn test_release_removes_immediately() {
    let runtime = MockRuntime::new();
    let helpers = HelperContainers::new(runtime.clone());
    let environment = Uuid::new_v4();
    let k = key("data", HelperMode::Write, environment);

    let record = helpers.acquire(k.clone()).await.unwrap();
    helpers.release(&k).await;

    assert_eq!(helpers.len().await, 0);
    assert!(!runtime
        .containers
        .lock()
        .await
        .contains_key(&record.container_id));
}

#[tokio::test]
async fn test_vanished_helper_is_recreated_on_acquire() {
    let runtime = MockRuntime::new();
    let helpers = HelperContainers::new(runtime.clone());
    let environment = Uuid::new_v4();
    let k = key("data", HelperMode::Read, environment);

    let first = helpers.acquire(k.clone()).await.unwrap();
    // Somebody pruned the helper behind the cache's back.
    runtime.containers.lock().await.remove(&first.container_id);

    let second = helpers.acquire(k).await.unwrap();
    assert_ne!(first.container_id, second.container_id);
    assert_eq!(helpers.len().await, 1);
}
