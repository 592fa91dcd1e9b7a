//! Container recreation: swap a container's image while preserving every
//! configured setting, rolling back to the original container on failure.
//!
//! Single forward pass, no persisted intermediate state:
//! Inspect -> DetectNetworkMode -> StopIfRunning -> RenameOldAway ->
//! DisconnectNetworks -> BuildCreateConfig -> CreateNew ->
//! ConnectRemainingNetworks -> StartIfWasRunning -> RemoveOld.
//! Until the swap commits (or rolls back), the renamed old container is the
//! rollback target.

mod diff;
mod plan;

pub use diff::{diff_inspects, DiffEntry};
pub use plan::{is_shared_namespace, RecreationPlan};

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use dockhand_common::{CleanupReport, DockhandError, EnvironmentId, Result};

use crate::client::models::ContainerInspect;
use crate::client::RuntimeApi;

#[derive(Debug, Clone, Default)]
pub struct RecreateOptions {
    /// Grace period handed to the stop call.
    pub stop_timeout_secs: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RecreateOutcome {
    pub container_id: String,
    pub old_container_id: String,
    pub name: String,
    pub running: bool,
    /// Number of (non-volatile) inspect fields that changed across the swap.
    pub changed_fields: usize,
}

#[derive(Clone)]
pub struct RecreationEngine {
    api: Arc<dyn RuntimeApi>,
}

impl RecreationEngine {
    pub fn new(api: Arc<dyn RuntimeApi>) -> Self {
        Self { api }
    }

    /// Replaces `reference` with a new container from `target_image` (or its
    /// current image when `None`), preserving name and configuration.
    #[instrument(skip(self, options), fields(environment = %environment, container = %reference))]
    pub async fn recreate(
        &self,
        environment: EnvironmentId,
        reference: &str,
        target_image: Option<&str>,
        options: RecreateOptions,
    ) -> Result<RecreateOutcome> {
        // Inspect: the snapshot is the single source of truth from here on.
        let snapshot = self.api.inspect_container(environment, reference).await?;
        let image = target_image.unwrap_or(&snapshot.config.image);

        // DetectNetworkMode: a mode referencing another container by id is
        // rewritten to that container's name before being carried forward.
        let netmode_container_name = self
            .resolve_network_mode_target(environment, &snapshot)
            .await?;

        let plan = RecreationPlan::build(&snapshot, image, netmode_container_name.as_deref());
        let name = plan.name.clone();
        let holding_name = format!("{name}-old-{}", short_token());

        info!(
            container = %name,
            image = %image,
            was_running = plan.was_running,
            shared_namespace = plan.shared_namespace,
            "recreating container"
        );

        // StopIfRunning.
        if plan.was_running {
            self.api
                .stop_container(environment, &snapshot.id, options.stop_timeout_secs)
                .await?;
        }

        // RenameOldAway: frees the name and marks the rollback target.
        self.api
            .rename_container(environment, &snapshot.id, &holding_name)
            .await?;

        // DisconnectNetworks: frees static addresses for the new container.
        // Skipped entirely for shared-namespace modes. A vanished network is
        // not fatal; the reconnect pass will surface anything real.
        if !plan.shared_namespace {
            for (network, _) in &plan.original_networks {
                if let Err(e) = self
                    .api
                    .disconnect_network(environment, network, &snapshot.id, true)
                    .await
                {
                    warn!(network = %network, error = %e, "failed to disconnect old container");
                }
            }
        }

        // CreateNew.
        let created = self
            .api
            .create_container(environment, &name, plan.create_body.clone())
            .await;
        let new_id = match created {
            Ok(id) => id,
            Err(e) => {
                warn!(container = %name, error = %e, "create failed, rolling back");
                self.rollback(environment, &snapshot, &plan, &holding_name, None)
                    .await;
                return Err(DockhandError::Recreation(format!(
                    "failed to create replacement for {name}: {e}"
                )));
            }
        };

        // ConnectRemainingNetworks: creation accepted only one endpoint.
        for (network, endpoint) in &plan.reconnect {
            if let Err(e) = self
                .api
                .connect_network(environment, network, &new_id, Some(endpoint.clone()))
                .await
            {
                warn!(network = %network, error = %e, "failed to reconnect network on new container");
            }
        }

        // StartIfWasRunning.
        if plan.was_running {
            if let Err(e) = self.api.start_container(environment, &new_id).await {
                warn!(container = %name, error = %e, "start failed, rolling back");
                self.rollback(environment, &snapshot, &plan, &holding_name, Some(&new_id))
                    .await;
                return Err(DockhandError::Recreation(format!(
                    "replacement for {name} failed to start: {e}"
                )));
            }
        }

        // RemoveOld: the swap has committed; losing the old container body
        // is no longer a rollback situation. Anonymous volumes were carried
        // into the new container's binds, so they are never removed here.
        if let Err(e) = self
            .api
            .remove_container(environment, &snapshot.id, true, false)
            .await
        {
            warn!(container = %holding_name, error = %e, "failed to remove old container");
        }

        let changed_fields = self.log_diff(environment, &snapshot, &new_id).await;

        info!(container = %name, id = %new_id, "recreation complete");
        Ok(RecreateOutcome {
            container_id: new_id,
            old_container_id: snapshot.id.clone(),
            name,
            running: plan.was_running,
            changed_fields,
        })
    }

    /// Resolves a `container:<ref>` network mode to the referenced
    /// container's current name.
    async fn resolve_network_mode_target(
        &self,
        environment: EnvironmentId,
        snapshot: &ContainerInspect,
    ) -> Result<Option<String>> {
        let Some(mode) = snapshot.host_config.network_mode.as_deref() else {
            return Ok(None);
        };
        let Some(target) = mode.strip_prefix("container:") else {
            return Ok(None);
        };
        let target_inspect = self.api.inspect_container(environment, target).await?;
        Ok(Some(target_inspect.plain_name().to_string()))
    }

    /// Best-effort restoration of the old container: remove the half-made
    /// replacement, put the original name back, reattach the original
    /// networks and restart if it was running. Every step is logged and
    /// none re-throws, so the root cause stays visible.
    async fn rollback(
        &self,
        environment: EnvironmentId,
        snapshot: &ContainerInspect,
        plan: &RecreationPlan,
        holding_name: &str,
        new_id: Option<&str>,
    ) {
        warn!(container = %plan.name, "rolling back recreation");

        if let Some(new_id) = new_id {
            let report = match self
                .api
                .remove_container(environment, new_id, true, false)
                .await
            {
                Ok(()) => CleanupReport::ok(),
                Err(e) => CleanupReport::failed(e),
            };
            if let Some(error) = &report.error {
                warn!(container = %plan.name, error = %error, "rollback: failed to remove replacement");
            }
        }

        if let Err(e) = self
            .api
            .rename_container(environment, &snapshot.id, &plan.name)
            .await
        {
            warn!(container = %holding_name, error = %e, "rollback: failed to restore original name");
        }

        if !plan.shared_namespace {
            for (network, endpoint) in &plan.original_networks {
                if let Err(e) = self
                    .api
                    .connect_network(environment, network, &snapshot.id, Some(endpoint.clone()))
                    .await
                {
                    warn!(network = %network, error = %e, "rollback: failed to reconnect network");
                }
            }
        }

        if plan.was_running {
            if let Err(e) = self.api.start_container(environment, &snapshot.id).await {
                warn!(container = %plan.name, error = %e, "rollback: failed to restart original container");
            }
        }
    }

    /// Deep-diffs the old and new inspects and logs the result. Never
    /// affects the outcome.
    async fn log_diff(
        &self,
        environment: EnvironmentId,
        snapshot: &ContainerInspect,
        new_id: &str,
    ) -> usize {
        let new_inspect = match self.api.inspect_container(environment, new_id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                debug!(error = %e, "skipping post-recreation diff");
                return 0;
            }
        };

        let old_value = match serde_json::to_value(snapshot) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let new_value = match serde_json::to_value(&new_inspect) {
            Ok(v) => v,
            Err(_) => return 0,
        };

        let entries = diff_inspects(&old_value, &new_value);
        info!(
            container = %snapshot.plain_name(),
            changed_fields = entries.len(),
            "post-recreation configuration diff"
        );
        for entry in &entries {
            debug!(path = %entry.path, old = %entry.old, new = %entry.new, "inspect field changed");
        }
        entries.len()
    }
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
