use bytes::Bytes;
use http::Method;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::instrument;

use dockhand_common::{DockhandError, EnvironmentId, Result};

use crate::demux::{demultiplex, DemuxOutput};

use super::http::{encode_query, ensure_status, DEFAULT_TIMEOUT, LONG_TIMEOUT};
use super::models::{
    ContainerInspect, ContainerSummary, CreateContainerBody, CreateContainerResponse,
};
use super::RuntimeClient;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub tail: Option<u32>,
    pub timestamps: bool,
    pub since: Option<i64>,
}

impl RuntimeClient {
    pub async fn list_containers(
        &self,
        environment: EnvironmentId,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("all", all.to_string())]);
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/containers/json{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", "list")?;
        response.json()
    }

    pub async fn inspect_container(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<ContainerInspect> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/containers/{reference}/json"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", reference)?;
        response.json()
    }

    #[instrument(skip(self, body), fields(environment = %environment, name = %name))]
    pub async fn create_container(
        &self,
        environment: EnvironmentId,
        name: &str,
        body: CreateContainerBody,
    ) -> Result<String> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("name", name.to_string())]);
        let payload = Bytes::from(serde_json::to_vec(&body).map_err(|e| {
            dockhand_common::DockhandError::Internal(format!("failed to encode create body: {e}"))
        })?);
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/create{query}"),
                Some(payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", name)?;
        let created: CreateContainerResponse = response.json()?;
        for warning in &created.warnings {
            tracing::warn!(container = %name, "create warning: {warning}");
        }
        Ok(created.id)
    }

    pub async fn start_container(&self, environment: EnvironmentId, id: &str) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/start"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        // 304 means already started.
        if response.status.as_u16() == 304 {
            return Ok(());
        }
        ensure_status(&response, "container", id)
    }

    pub async fn stop_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        timeout_secs: Option<u32>,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = match timeout_secs {
            Some(t) => encode_query(&[("t", t.to_string())]),
            None => String::new(),
        };
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/stop{query}"),
                None,
                // The daemon waits out the stop grace period before replying.
                LONG_TIMEOUT,
            )
            .await?;
        if response.status.as_u16() == 304 {
            return Ok(());
        }
        ensure_status(&response, "container", id)
    }

    pub async fn restart_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        timeout_secs: Option<u32>,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = match timeout_secs {
            Some(t) => encode_query(&[("t", t.to_string())]),
            None => String::new(),
        };
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/restart{query}"),
                None,
                LONG_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)
    }

    pub async fn kill_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        signal: Option<&str>,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = match signal {
            Some(signal) => encode_query(&[("signal", signal.to_string())]),
            None => String::new(),
        };
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/kill{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)
    }

    pub async fn rename_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        new_name: &str,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("name", new_name.to_string())]);
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/rename{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)
    }

    pub async fn remove_container(
        &self,
        environment: EnvironmentId,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[
            ("force", force.to_string()),
            ("v", remove_volumes.to_string()),
        ]);
        let response = self
            .invoke(
                &descriptor,
                Method::DELETE,
                &format!("/containers/{id}{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)
    }

    /// Blocks until the container exits; returns its exit code.
    pub async fn wait_container(&self, environment: EnvironmentId, id: &str) -> Result<i64> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/wait"),
                None,
                LONG_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)?;
        let body: serde_json::Value = response.json()?;
        Ok(body
            .get("StatusCode")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1))
    }

    /// Fetches recent log output, demultiplexed into stdout/stderr.
    pub async fn container_logs(
        &self,
        environment: EnvironmentId,
        id: &str,
        options: LogOptions,
    ) -> Result<DemuxOutput> {
        let descriptor = self.environments.resolve(environment).await?;
        let mut pairs = vec![
            ("stdout", "true".to_string()),
            ("stderr", "true".to_string()),
            ("timestamps", options.timestamps.to_string()),
        ];
        if let Some(tail) = options.tail {
            pairs.push(("tail", tail.to_string()));
        }
        if let Some(since) = options.since {
            pairs.push(("since", since.to_string()));
        }
        let query = encode_query(&pairs);
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/containers/{id}/logs{query}"),
                None,
                LONG_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)?;
        Ok(demultiplex(&response.body))
    }

    /// Follows a container's log stream. Each received item is one
    /// demultiplexed batch; a frame truncated at a chunk boundary is carried
    /// into the next batch, so multi-byte characters and split frames decode
    /// intact. The channel closes when the stream ends.
    pub async fn follow_logs(
        &self,
        environment: EnvironmentId,
        id: &str,
        options: LogOptions,
    ) -> Result<mpsc::Receiver<Result<DemuxOutput>>> {
        let descriptor = self.environments.resolve(environment).await?;
        let mut pairs = vec![
            ("follow", "true".to_string()),
            ("stdout", "true".to_string()),
            ("stderr", "true".to_string()),
            ("timestamps", options.timestamps.to_string()),
        ];
        if let Some(tail) = options.tail {
            pairs.push(("tail", tail.to_string()));
        }
        if let Some(since) = options.since {
            pairs.push(("since", since.to_string()));
        }
        let query = encode_query(&pairs);

        let mut stream = self
            .invoke_stream(
                &descriptor,
                Method::GET,
                &format!("/containers/{id}/logs{query}"),
                None,
                None,
            )
            .await?;

        if !stream.status.is_success() {
            let mut body = Vec::new();
            while let Some(Ok(chunk)) = stream.chunks.recv().await {
                body.extend_from_slice(&chunk);
            }
            if stream.status.as_u16() == 404 {
                return Err(DockhandError::NotFound {
                    kind: "container",
                    name: id.to_string(),
                });
            }
            return Err(DockhandError::Api {
                status: stream.status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        let (tx, rx) = mpsc::channel::<Result<DemuxOutput>>(16);
        tokio::spawn(async move {
            let mut carry: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.chunks.recv().await {
                match chunk {
                    Ok(bytes) => {
                        carry.extend_from_slice(&bytes);
                        let mut batch = demultiplex(&carry);
                        carry = std::mem::take(&mut batch.remaining);
                        if batch.stdout.is_empty() && batch.stderr.is_empty() {
                            continue;
                        }
                        if tx.send(Ok(batch)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// One-shot (non-streaming) stats sample.
    pub async fn container_stats(
        &self,
        environment: EnvironmentId,
        id: &str,
    ) -> Result<serde_json::Value> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/containers/{id}/stats?stream=false"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)?;
        response.json()
    }

    /// Updates a container's restart policy in place.
    pub async fn update_restart_policy(
        &self,
        environment: EnvironmentId,
        id: &str,
        policy: &str,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let payload = Bytes::from(
            serde_json::to_vec(&json!({ "RestartPolicy": { "Name": policy } })).expect("static json"),
        );
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{id}/update"),
                Some(payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", id)
    }
}
