use http::Method;

use dockhand_common::{DockhandError, EnvironmentId, Result};

use super::http::{ensure_status, DEFAULT_TIMEOUT, LONG_TIMEOUT};
use super::RuntimeClient;

impl RuntimeClient {
    /// Liveness probe; also how the UI decides whether an environment is up.
    pub async fn ping(&self, environment: EnvironmentId) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/_ping", None, DEFAULT_TIMEOUT)
            .await?;
        if !response.status.is_success() {
            return Err(DockhandError::Api {
                status: response.status.as_u16(),
                message: "runtime ping failed".to_string(),
            });
        }
        Ok(())
    }

    pub async fn version(&self, environment: EnvironmentId) -> Result<serde_json::Value> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/version", None, DEFAULT_TIMEOUT)
            .await?;
        ensure_status(&response, "system", "version")?;
        response.json()
    }

    pub async fn info(&self, environment: EnvironmentId) -> Result<serde_json::Value> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/info", None, DEFAULT_TIMEOUT)
            .await?;
        ensure_status(&response, "system", "info")?;
        response.json()
    }

    /// Per-object disk usage. The daemon sizes every layer and volume to
    /// answer this, which can take a while on large hosts.
    pub async fn disk_usage(&self, environment: EnvironmentId) -> Result<serde_json::Value> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/system/df", None, LONG_TIMEOUT)
            .await?;
        ensure_status(&response, "system", "disk usage")?;
        response.json()
    }
}
