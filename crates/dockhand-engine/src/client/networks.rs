use bytes::Bytes;
use http::Method;
use serde_json::json;

use dockhand_common::{DockhandError, EnvironmentId, Result};

use super::http::{ensure_status, DEFAULT_TIMEOUT};
use super::models::{EndpointSettings, Network};
use super::RuntimeClient;

impl RuntimeClient {
    pub async fn list_networks(&self, environment: EnvironmentId) -> Result<Vec<Network>> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/networks", None, DEFAULT_TIMEOUT)
            .await?;
        ensure_status(&response, "network", "list")?;
        response.json()
    }

    pub async fn inspect_network(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<Network> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/networks/{reference}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "network", reference)?;
        response.json()
    }

    /// Attaches a container to a network, optionally with full endpoint
    /// settings (aliases, static addresses, gateway priority).
    pub async fn connect_network(
        &self,
        environment: EnvironmentId,
        network: &str,
        container: &str,
        endpoint: Option<EndpointSettings>,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let payload = match endpoint {
            Some(endpoint) => json!({
                "Container": container,
                "EndpointConfig": endpoint,
            }),
            None => json!({ "Container": container }),
        };
        let payload = Bytes::from(serde_json::to_vec(&payload).map_err(|e| {
            DockhandError::Internal(format!("failed to encode connect body: {e}"))
        })?);
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/networks/{network}/connect"),
                Some(payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "network", network)
    }

    pub async fn disconnect_network(
        &self,
        environment: EnvironmentId,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let payload = Bytes::from(
            serde_json::to_vec(&json!({ "Container": container, "Force": force }))
                .map_err(|e| DockhandError::Internal(format!("failed to encode body: {e}")))?,
        );
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/networks/{network}/disconnect"),
                Some(payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "network", network)
    }
}
