//! Multi-environment container control-plane engine: transport resolution
//! over Unix socket, TCP, mutual TLS and tunneled RPC; a
//! configuration-preserving container recreation state machine; and a
//! scan-gated safe auto-update pipeline.
//!
//! The engine is consumed in-process by a presentation layer. It exposes
//! typed operations and typed failures and has no wire protocol of its own.

use std::sync::Arc;

// Re-export the vocabulary crate for consumers.
pub use dockhand_common as common;

pub mod client;
pub mod demux;
pub mod helper;
pub mod recreate;
pub mod registry;
pub mod transport;
pub mod update;

use dockhand_common::{EnvironmentProvider, Scanner, ScannerSettings, TunnelTransport};

use client::{RuntimeApi, RuntimeClient};
use helper::HelperContainers;
use recreate::RecreationEngine;
use registry::RegistryClient;
use transport::EnvironmentCache;
use update::{ScanCoordinator, UpdatePipeline};

/// The assembled engine: process-scoped caches and the component stack
/// wired over one runtime client. Construct once at startup; call
/// [`Engine::sweep`] from a periodic task; `clear` methods on the parts
/// reset state in tests.
#[derive(Clone)]
pub struct Engine {
    environments: Arc<EnvironmentCache>,
    client: RuntimeClient,
    recreation: RecreationEngine,
    updates: UpdatePipeline,
    helpers: Arc<HelperContainers>,
    scans: ScanCoordinator,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        tunnel: Option<Arc<dyn TunnelTransport>>,
        scanner: Arc<dyn Scanner>,
        scanner_settings: ScannerSettings,
    ) -> Self {
        let environments = Arc::new(EnvironmentCache::new(provider));
        let client = RuntimeClient::new(environments.clone(), tunnel);
        let api: Arc<dyn RuntimeApi> = Arc::new(client.clone());

        let recreation = RecreationEngine::new(api.clone());
        let scans = ScanCoordinator::new(scanner, scanner_settings);
        let updates = UpdatePipeline::new(
            api.clone(),
            Arc::new(RegistryClient::new()),
            scans.clone(),
            recreation.clone(),
        );
        let helpers = Arc::new(HelperContainers::new(api));

        Self {
            environments,
            client,
            recreation,
            updates,
            helpers,
            scans,
        }
    }

    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }

    pub fn environments(&self) -> &Arc<EnvironmentCache> {
        &self.environments
    }

    pub fn recreation(&self) -> &RecreationEngine {
        &self.recreation
    }

    pub fn updates(&self) -> &UpdatePipeline {
        &self.updates
    }

    pub fn helpers(&self) -> &Arc<HelperContainers> {
        &self.helpers
    }

    pub fn scans(&self) -> &ScanCoordinator {
        &self.scans
    }

    /// One pass over every TTL'd cache. Run this from a periodic task; the
    /// engine does not own timers.
    pub async fn sweep(&self) {
        self.environments.sweep();
        self.helpers.sweep().await;
        self.scans.sweep().await;
    }
}
