//! Typed client for the container runtime's HTTP API.
//!
//! Operations are grouped per resource; all of them resolve the target
//! environment through the transport cache on every call, so an environment
//! edit is picked up no later than the next request after invalidation.

pub mod http;
pub mod models;

mod containers;
mod exec;
mod images;
mod networks;
mod system;
mod volumes;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dockhand_common::{EnvironmentId, Result, TunnelTransport};

use crate::transport::EnvironmentCache;

pub use containers::LogOptions;
pub use exec::ExecOutput;
pub use http::{ApiResponse, DEFAULT_TIMEOUT, LONG_TIMEOUT};
pub use models::{
    ContainerInspect, ContainerSummary, CreateContainerBody, EndpointSettings, ImageInspect,
    ImageSummary, Network, PullProgress, Volume,
};

/// Client over the resolved transports. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeClient {
    pub(crate) environments: Arc<EnvironmentCache>,
    pub(crate) tunnel: Option<Arc<dyn TunnelTransport>>,
}

impl RuntimeClient {
    pub fn new(
        environments: Arc<EnvironmentCache>,
        tunnel: Option<Arc<dyn TunnelTransport>>,
    ) -> Self {
        Self {
            environments,
            tunnel,
        }
    }

    pub fn environments(&self) -> &Arc<EnvironmentCache> {
        &self.environments
    }
}

/// The slice of the runtime API the orchestration engines run on. A trait so
/// tests can script the runtime's behavior without a daemon.
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    async fn inspect_container(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<ContainerInspect>;

    /// Creates a container and returns its id.
    async fn create_container(
        &self,
        environment: EnvironmentId,
        name: &str,
        body: CreateContainerBody,
    ) -> Result<String>;

    async fn start_container(&self, environment: EnvironmentId, id: &str) -> Result<()>;

    async fn stop_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        timeout_secs: Option<u32>,
    ) -> Result<()>;

    async fn rename_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        new_name: &str,
    ) -> Result<()>;

    async fn remove_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<()>;

    async fn connect_network(
        &self,
        environment: EnvironmentId,
        network: &str,
        container: &str,
        endpoint: Option<EndpointSettings>,
    ) -> Result<()>;

    async fn disconnect_network(
        &self,
        environment: EnvironmentId,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<()>;

    async fn inspect_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<ImageInspect>;

    /// Pulls an image, optionally forwarding progress events. `auth` is the
    /// pre-encoded registry auth header value for the daemon.
    async fn pull_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
        auth: Option<String>,
        progress: Option<mpsc::Sender<PullProgress>>,
    ) -> Result<()>;

    async fn tag_image(
        &self,
        environment: EnvironmentId,
        source: &str,
        repo: &str,
        tag: &str,
    ) -> Result<()>;

    async fn remove_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
        force: bool,
    ) -> Result<()>;
}

#[async_trait]
impl RuntimeApi for RuntimeClient {
    async fn inspect_container(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<ContainerInspect> {
        RuntimeClient::inspect_container(self, environment, reference).await
    }

    async fn create_container(
        &self,
        environment: EnvironmentId,
        name: &str,
        body: CreateContainerBody,
    ) -> Result<String> {
        RuntimeClient::create_container(self, environment, name, body).await
    }

    async fn start_container(&self, environment: EnvironmentId, id: &str) -> Result<()> {
        RuntimeClient::start_container(self, environment, id).await
    }

    async fn stop_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        timeout_secs: Option<u32>,
    ) -> Result<()> {
        RuntimeClient::stop_container(self, environment, id, timeout_secs).await
    }

    async fn rename_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        new_name: &str,
    ) -> Result<()> {
        RuntimeClient::rename_container(self, environment, id, new_name).await
    }

    async fn remove_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<()> {
        RuntimeClient::remove_container(self, environment, id, force, remove_volumes).await
    }

    async fn connect_network(
        &self,
        environment: EnvironmentId,
        network: &str,
        container: &str,
        endpoint: Option<EndpointSettings>,
    ) -> Result<()> {
        RuntimeClient::connect_network(self, environment, network, container, endpoint).await
    }

    async fn disconnect_network(
        &self,
        environment: EnvironmentId,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<()> {
        RuntimeClient::disconnect_network(self, environment, network, container, force).await
    }

    async fn inspect_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<ImageInspect> {
        RuntimeClient::inspect_image(self, environment, reference).await
    }

    async fn pull_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
        auth: Option<String>,
        progress: Option<mpsc::Sender<PullProgress>>,
    ) -> Result<()> {
        RuntimeClient::pull_image(self, environment, reference, auth, progress).await
    }

    async fn tag_image(
        &self,
        environment: EnvironmentId,
        source: &str,
        repo: &str,
        tag: &str,
    ) -> Result<()> {
        RuntimeClient::tag_image(self, environment, source, repo, tag).await
    }

    async fn remove_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
        force: bool,
    ) -> Result<()> {
        RuntimeClient::remove_image(self, environment, reference, force).await
    }
}
