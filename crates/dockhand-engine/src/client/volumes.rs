use bytes::Bytes;
use http::Method;
use serde::Deserialize;
use serde_json::json;

use dockhand_common::{DockhandError, EnvironmentId, Result};

use super::http::{encode_query, ensure_status, DEFAULT_TIMEOUT};
use super::models::Volume;
use super::RuntimeClient;

impl RuntimeClient {
    pub async fn list_volumes(&self, environment: EnvironmentId) -> Result<Vec<Volume>> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/volumes", None, DEFAULT_TIMEOUT)
            .await?;
        ensure_status(&response, "volume", "list")?;

        #[derive(Deserialize)]
        struct VolumeList {
            #[serde(rename = "Volumes", default)]
            volumes: Vec<Volume>,
        }
        let list: VolumeList = response.json()?;
        Ok(list.volumes)
    }

    pub async fn inspect_volume(&self, environment: EnvironmentId, name: &str) -> Result<Volume> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/volumes/{name}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "volume", name)?;
        response.json()
    }

    pub async fn create_volume(&self, environment: EnvironmentId, name: &str) -> Result<Volume> {
        let descriptor = self.environments.resolve(environment).await?;
        let payload = Bytes::from(
            serde_json::to_vec(&json!({ "Name": name }))
                .map_err(|e| DockhandError::Internal(format!("failed to encode body: {e}")))?,
        );
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                "/volumes/create",
                Some(payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "volume", name)?;
        response.json()
    }

    pub async fn remove_volume(
        &self,
        environment: EnvironmentId,
        name: &str,
        force: bool,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("force", force.to_string())]);
        let response = self
            .invoke(
                &descriptor,
                Method::DELETE,
                &format!("/volumes/{name}{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "volume", name)
    }
}
