//! Recreation engine flows against the scripted runtime.

mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use uuid::Uuid;

use dockhand_engine::client::models::{
    ContainerConfig, ContainerInspect, ContainerState, EndpointIpamConfig, EndpointSettings,
    HostConfig, MountPoint, NetworkSettings,
};
use dockhand_engine::recreate::{RecreateOptions, RecreationEngine};
use support::MockRuntime;

fn endpoint(alias: &str, ip: &str) -> EndpointSettings {
    EndpointSettings {
        aliases: Some(vec![alias.to_string()]),
        ipam_config: Some(EndpointIpamConfig {
            ipv4_address: Some(ip.to_string()),
            ..Default::default()
        }),
        endpoint_id: Some("ep-runtime".to_string()),
        ip_address: Some(ip.to_string()),
        ..Default::default()
    }
}

fn web_container() -> ContainerInspect {
    ContainerInspect {
        id: "old-1".to_string(),
        name: "/web".to_string(),
        image: "sha256:oldimage".to_string(),
        state: ContainerState {
            running: true,
            status: "running".to_string(),
            ..Default::default()
        },
        config: ContainerConfig {
            image: "app:1.0".to_string(),
            env: Some(vec!["MODE=prod".to_string()]),
            ..Default::default()
        },
        host_config: HostConfig {
            network_mode: Some("bridge".to_string()),
            binds: Some(vec!["data:/var/lib/data".to_string()]),
            ..Default::default()
        },
        network_settings: NetworkSettings {
            networks: HashMap::from([
                ("app-net".to_string(), endpoint("api", "172.20.0.5")),
                ("ops-net".to_string(), endpoint("metrics", "172.21.0.9")),
            ]),
            ..Default::default()
        },
        mounts: vec![MountPoint {
            mount_type: "volume".to_string(),
            name: Some("anonvol123".to_string()),
            source: "/var/lib/docker/volumes/anonvol123/_data".to_string(),
            destination: "/var/cache/app".to_string(),
            mode: String::new(),
            rw: true,
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_recreate_preserves_networks_and_volumes() {
    support::init_tracing();
    let runtime = MockRuntime::new();
    runtime.add_container(web_container()).await;
    let engine = RecreationEngine::new(runtime.clone());
    let environment = Uuid::new_v4();

    let outcome = engine
        .recreate(environment, "web", Some("app:2.0"), RecreateOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.old_container_id, "old-1");
    assert!(outcome.running);

    // Old container gone, replacement holds the original name and runs.
    assert!(!runtime.containers.lock().await.contains_key("old-1"));
    let replacement = runtime.container_by_name("web").await.unwrap();
    assert_eq!(replacement.id, outcome.container_id);
    assert!(replacement.state.running);
    assert_eq!(replacement.config.image, "app:2.0");

    // Both networks attached with original alias and static address.
    let app_net = &replacement.network_settings.networks["app-net"];
    assert_eq!(app_net.aliases.as_ref().unwrap().as_slice(), ["api"]);
    assert_eq!(app_net.ip_address.as_deref(), Some("172.20.0.5"));
    let ops_net = &replacement.network_settings.networks["ops-net"];
    assert_eq!(ops_net.aliases.as_ref().unwrap().as_slice(), ["metrics"]);
    assert_eq!(ops_net.ip_address.as_deref(), Some("172.21.0.9"));

    // The anonymous volume was synthesized into the binds.
    let body = runtime.last_create_body.lock().await.clone().unwrap();
    let binds = body.host_config.binds.unwrap();
    assert!(binds.contains(&"data:/var/lib/data".to_string()));
    assert!(binds.contains(&"anonvol123:/var/cache/app".to_string()));

    // Exactly one endpoint at create; the other reconnected afterwards.
    assert_eq!(
        body.networking_config.unwrap().endpoints_config.len(),
        1
    );
    assert_eq!(runtime.calls_matching("connect_network:").await, 1);
}

#[tokio::test]
async fn test_start_failure_rolls_back_to_original() {
    let runtime = MockRuntime::new();
    runtime.add_container(web_container()).await;
    runtime.fail_start_created.store(true, Ordering::SeqCst);
    let engine = RecreationEngine::new(runtime.clone());
    let environment = Uuid::new_v4();

    let err = engine
        .recreate(environment, "web", Some("app:2.0"), RecreateOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to start"));

    // The replacement was removed; the original is back under its name,
    // running, with its networks reconnected.
    let containers = runtime.containers.lock().await;
    assert_eq!(containers.len(), 1);
    let original = containers.get("old-1").unwrap();
    assert_eq!(original.plain_name(), "web");
    assert!(original.state.running);
    assert!(original.network_settings.networks.contains_key("app-net"));
    assert!(original.network_settings.networks.contains_key("ops-net"));
}

#[tokio::test]
async fn test_create_failure_rolls_back_without_replacement() {
    let runtime = MockRuntime::new();
    runtime.add_container(web_container()).await;
    runtime.fail_create.store(true, Ordering::SeqCst);
    let engine = RecreationEngine::new(runtime.clone());
    let environment = Uuid::new_v4();

    let err = engine
        .recreate(environment, "web", Some("app:2.0"), RecreateOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to create"));

    let containers = runtime.containers.lock().await;
    assert_eq!(containers.len(), 1);
    let original = containers.get("old-1").unwrap();
    assert_eq!(original.plain_name(), "web");
    assert!(original.state.running);
}

#[tokio::test]
async fn test_shared_namespace_modes_skip_network_calls() {
    for mode in ["host", "none"] {
        let runtime = MockRuntime::new();
        let mut container = web_container();
        container.host_config.network_mode = Some(mode.to_string());
        container.network_settings.networks.clear();
        runtime.add_container(container).await;

        let engine = RecreationEngine::new(runtime.clone());
        engine
            .recreate(
                Uuid::new_v4(),
                "web",
                Some("app:2.0"),
                RecreateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(runtime.calls_matching("disconnect_network:").await, 0, "mode {mode}");
        assert_eq!(runtime.calls_matching("connect_network:").await, 0, "mode {mode}");
    }
}

#[tokio::test]
async fn test_container_network_mode_is_rewritten_to_name() {
    let runtime = MockRuntime::new();

    let database = ContainerInspect {
        id: "db-id-9876".to_string(),
        name: "/database".to_string(),
        config: ContainerConfig {
            image: "postgres:16".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    runtime.add_container(database).await;

    let mut container = web_container();
    // References the sidecar by raw id, which would go stale.
    container.host_config.network_mode = Some("container:db-id-9876".to_string());
    container.network_settings.networks.clear();
    runtime.add_container(container).await;

    let engine = RecreationEngine::new(runtime.clone());
    engine
        .recreate(
            Uuid::new_v4(),
            "web",
            Some("app:2.0"),
            RecreateOptions::default(),
        )
        .await
        .unwrap();

    let body = runtime.last_create_body.lock().await.clone().unwrap();
    assert_eq!(
        body.host_config.network_mode.as_deref(),
        Some("container:database")
    );
    assert_eq!(runtime.calls_matching("disconnect_network:").await, 0);
}

#[tokio::test]
async fn test_stopped_container_stays_stopped() {
    let runtime = MockRuntime::new();
    let mut container = web_container();
    container.state.running = false;
    container.state.status = "exited".to_string();
    runtime.add_container(container).await;

    let engine = RecreationEngine::new(runtime.clone());
    let outcome = engine
        .recreate(
            Uuid::new_v4(),
            "web",
            None,
            RecreateOptions::default(),
        )
        .await
        .unwrap();

    assert!(!outcome.running);
    assert_eq!(runtime.calls_matching("stop_container:").await, 0);
    assert_eq!(runtime.calls_matching("start_container:").await, 0);
    let replacement = runtime.container_by_name("web").await.unwrap();
    assert!(!replacement.state.running);
    // Recreating without a target image keeps the current one.
    assert_eq!(replacement.config.image, "app:1.0");
}
