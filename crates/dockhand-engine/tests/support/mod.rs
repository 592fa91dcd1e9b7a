//! Scripted in-memory runtime for driving the orchestration engines
//! without a daemon.

// Each integration binary compiles its own copy; not every binary touches
// every helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use dockhand_common::{
    DockhandError, EnvironmentId, Result, ScanFindings, Scanner, SeverityTally,
};
use dockhand_engine::client::models::{
    ContainerInspect, CreateContainerBody, EndpointSettings, ImageInspect, NetworkSettings,
    PullProgress,
};
use dockhand_engine::client::RuntimeApi;
use dockhand_engine::registry::{ImageRef, RegistryCredential, RegistryProbe};

/// Installs a test subscriber once so failing runs show the engine's spans.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// In-memory runtime with just enough behavior for the engines: containers
/// keyed by id, images keyed by id with a tag table, a call log, and
/// injectable failures.
#[derive(Default)]
pub struct MockRuntime {
    pub containers: Mutex<HashMap<String, ContainerInspect>>,
    pub images: Mutex<HashMap<String, ImageInspect>>,
    /// `repo:tag` reference -> image id.
    pub tags: Mutex<HashMap<String, String>>,
    /// What a pull of a reference installs: (image id, inspect).
    pub pull_results: Mutex<HashMap<String, (String, ImageInspect)>>,
    pub calls: Mutex<Vec<String>>,
    pub last_create_body: Mutex<Option<CreateContainerBody>>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    /// Fail the first start of any container created during the test.
    pub fail_start_created: AtomicBool,
    created: Mutex<HashSet<String>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add_container(&self, inspect: ContainerInspect) {
        self.containers
            .lock()
            .await
            .insert(inspect.id.clone(), inspect);
    }

    pub async fn add_image(&self, reference: &str, inspect: ImageInspect) {
        self.tags
            .lock()
            .await
            .insert(reference.to_string(), inspect.id.clone());
        self.images
            .lock()
            .await
            .insert(inspect.id.clone(), inspect);
    }

    pub async fn set_pull_result(&self, reference: &str, inspect: ImageInspect) {
        self.pull_results
            .lock()
            .await
            .insert(reference.to_string(), (inspect.id.clone(), inspect));
    }

    pub async fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub async fn tag_target(&self, reference: &str) -> Option<String> {
        self.tags.lock().await.get(reference).cloned()
    }

    pub async fn container_by_name(&self, name: &str) -> Option<ContainerInspect> {
        self.containers
            .lock()
            .await
            .values()
            .find(|c| c.plain_name() == name)
            .cloned()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }

    async fn find_container_id(&self, reference: &str) -> Result<String> {
        let containers = self.containers.lock().await;
        if containers.contains_key(reference) {
            return Ok(reference.to_string());
        }
        containers
            .values()
            .find(|c| c.plain_name() == reference)
            .map(|c| c.id.clone())
            .ok_or(DockhandError::NotFound {
                kind: "container",
                name: reference.to_string(),
            })
    }

    /// Mimics the runtime's endpoint materialization: the requested static
    /// address becomes the effective one.
    fn materialize_endpoint(endpoint: &EndpointSettings) -> EndpointSettings {
        let mut out = endpoint.clone();
        if let Some(ipam) = &out.ipam_config {
            out.ip_address = ipam.ipv4_address.clone();
        }
        out
    }
}

#[async_trait]
impl RuntimeApi for MockRuntime {
    async fn inspect_container(
        &self,
        _environment: EnvironmentId,
        reference: &str,
    ) -> Result<ContainerInspect> {
        self.record(format!("inspect_container:{reference}")).await;
        let id = self.find_container_id(reference).await?;
        Ok(self.containers.lock().await[&id].clone())
    }

    async fn create_container(
        &self,
        _environment: EnvironmentId,
        name: &str,
        body: CreateContainerBody,
    ) -> Result<String> {
        self.record(format!("create_container:{name}")).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DockhandError::Api {
                status: 500,
                message: "injected create failure".to_string(),
            });
        }

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut networks = HashMap::new();
        if let Some(networking) = &body.networking_config {
            for (network, endpoint) in &networking.endpoints_config {
                networks.insert(network.clone(), Self::materialize_endpoint(endpoint));
            }
        }

        let inspect = ContainerInspect {
            id: id.clone(),
            name: format!("/{name}"),
            image: format!("sha256:{name}-image"),
            config: body.config.clone(),
            host_config: body.host_config.clone(),
            network_settings: NetworkSettings {
                networks,
                ..Default::default()
            },
            ..Default::default()
        };

        *self.last_create_body.lock().await = Some(body);
        self.containers.lock().await.insert(id.clone(), inspect);
        self.created.lock().await.insert(id.clone());
        Ok(id)
    }

    async fn start_container(&self, _environment: EnvironmentId, id: &str) -> Result<()> {
        self.record(format!("start_container:{id}")).await;
        if self.fail_start_created.load(Ordering::SeqCst)
            && self.created.lock().await.contains(id)
        {
            return Err(DockhandError::Api {
                status: 500,
                message: "injected start failure".to_string(),
            });
        }
        let mut containers = self.containers.lock().await;
        let container = containers.get_mut(id).ok_or(DockhandError::NotFound {
            kind: "container",
            name: id.to_string(),
        })?;
        container.state.running = true;
        container.state.status = "running".to_string();
        Ok(())
    }

    async fn stop_container(
        &self,
        _environment: EnvironmentId,
        id: &str,
        _timeout_secs: Option<u32>,
    ) -> Result<()> {
        self.record(format!("stop_container:{id}")).await;
        let mut containers = self.containers.lock().await;
        let container = containers.get_mut(id).ok_or(DockhandError::NotFound {
            kind: "container",
            name: id.to_string(),
        })?;
        container.state.running = false;
        container.state.status = "exited".to_string();
        Ok(())
    }

    async fn rename_container(
        &self,
        _environment: EnvironmentId,
        id: &str,
        new_name: &str,
    ) -> Result<()> {
        self.record(format!("rename_container:{id}->{new_name}")).await;
        let mut containers = self.containers.lock().await;
        let container = containers.get_mut(id).ok_or(DockhandError::NotFound {
            kind: "container",
            name: id.to_string(),
        })?;
        container.name = format!("/{new_name}");
        Ok(())
    }

    async fn remove_container(
        &self,
        _environment: EnvironmentId,
        id: &str,
        _force: bool,
        _remove_volumes: bool,
    ) -> Result<()> {
        self.record(format!("remove_container:{id}")).await;
        self.containers
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(DockhandError::NotFound {
                kind: "container",
                name: id.to_string(),
            })
    }

    async fn connect_network(
        &self,
        _environment: EnvironmentId,
        network: &str,
        container: &str,
        endpoint: Option<EndpointSettings>,
    ) -> Result<()> {
        self.record(format!("connect_network:{network}:{container}")).await;
        let mut containers = self.containers.lock().await;
        let target = containers
            .get_mut(container)
            .ok_or(DockhandError::NotFound {
                kind: "container",
                name: container.to_string(),
            })?;
        target.network_settings.networks.insert(
            network.to_string(),
            Self::materialize_endpoint(&endpoint.unwrap_or_default()),
        );
        Ok(())
    }

    async fn disconnect_network(
        &self,
        _environment: EnvironmentId,
        network: &str,
        container: &str,
        _force: bool,
    ) -> Result<()> {
        self.record(format!("disconnect_network:{network}:{container}")).await;
        let mut containers = self.containers.lock().await;
        let target = containers
            .get_mut(container)
            .ok_or(DockhandError::NotFound {
                kind: "container",
                name: container.to_string(),
            })?;
        target.network_settings.networks.remove(network);
        Ok(())
    }

    async fn inspect_image(
        &self,
        _environment: EnvironmentId,
        reference: &str,
    ) -> Result<ImageInspect> {
        self.record(format!("inspect_image:{reference}")).await;
        let images = self.images.lock().await;
        if let Some(image) = images.get(reference) {
            return Ok(image.clone());
        }
        let tags = self.tags.lock().await;
        tags.get(reference)
            .and_then(|id| images.get(id))
            .cloned()
            .ok_or(DockhandError::NotFound {
                kind: "image",
                name: reference.to_string(),
            })
    }

    async fn pull_image(
        &self,
        _environment: EnvironmentId,
        reference: &str,
        _auth: Option<String>,
        progress: Option<mpsc::Sender<PullProgress>>,
    ) -> Result<()> {
        self.record(format!("pull_image:{reference}")).await;
        let pulled = self.pull_results.lock().await.get(reference).cloned();
        let (id, inspect) = pulled.ok_or(DockhandError::Registry(format!(
            "no scripted pull result for {reference}"
        )))?;
        if let Some(progress) = progress {
            let _ = progress.try_send(PullProgress {
                status: "Pull complete".to_string(),
                ..Default::default()
            });
        }
        self.images.lock().await.insert(id.clone(), inspect);
        self.tags.lock().await.insert(reference.to_string(), id);
        Ok(())
    }

    async fn tag_image(
        &self,
        _environment: EnvironmentId,
        source: &str,
        repo: &str,
        tag: &str,
    ) -> Result<()> {
        self.record(format!("tag_image:{source}->{repo}:{tag}")).await;
        let id = {
            let images = self.images.lock().await;
            if images.contains_key(source) {
                source.to_string()
            } else {
                let tags = self.tags.lock().await;
                tags.get(source).cloned().ok_or(DockhandError::NotFound {
                    kind: "image",
                    name: source.to_string(),
                })?
            }
        };
        self.tags.lock().await.insert(format!("{repo}:{tag}"), id);
        Ok(())
    }

    async fn remove_image(
        &self,
        _environment: EnvironmentId,
        reference: &str,
        _force: bool,
    ) -> Result<()> {
        self.record(format!("remove_image:{reference}")).await;
        let mut tags = self.tags.lock().await;
        if tags.remove(reference).is_some() {
            return Ok(());
        }
        drop(tags);
        let mut images = self.images.lock().await;
        images
            .remove(reference)
            .map(|_| ())
            .ok_or(DockhandError::NotFound {
                kind: "image",
                name: reference.to_string(),
            })
    }
}

/// Registry probe with a scripted answer.
pub struct MockRegistry {
    digest: Option<String>,
}

impl MockRegistry {
    pub fn with_digest(digest: &str) -> Arc<Self> {
        Arc::new(Self {
            digest: Some(digest.to_string()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self { digest: None })
    }
}

#[async_trait]
impl RegistryProbe for MockRegistry {
    async fn manifest_digest(
        &self,
        _image: &ImageRef,
        _credential: Option<&RegistryCredential>,
    ) -> Result<String> {
        self.digest
            .clone()
            .ok_or_else(|| DockhandError::Registry("registry unreachable: scripted".to_string()))
    }
}

/// Scanner returning a fixed tally for every image.
pub struct ScriptedScanner {
    pub tally: SeverityTally,
    pub configured: bool,
}

#[async_trait]
impl Scanner for ScriptedScanner {
    async fn scan(&self, image: &str, _environment: EnvironmentId) -> Result<Vec<ScanFindings>> {
        if !self.configured {
            return Ok(vec![]);
        }
        Ok(vec![ScanFindings {
            scanner: "scripted".to_string(),
            tally: self.tally,
            findings: serde_json::json!({ "image": image }),
        }])
    }
}
