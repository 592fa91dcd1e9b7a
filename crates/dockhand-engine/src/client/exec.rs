use bytes::Bytes;
use http::Method;
use serde_json::json;
use tracing::instrument;

use dockhand_common::{DockhandError, EnvironmentId, Result};

use crate::demux::demultiplex;

use super::http::{encode_query, ensure_status, DEFAULT_TIMEOUT, LONG_TIMEOUT};
use super::RuntimeClient;

/// Result of a non-interactive exec run.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl RuntimeClient {
    /// Runs a command inside a container and collects its output.
    /// Interactive (TTY) sessions are the tunnel collaborator's business;
    /// this covers the engine's own one-shot commands.
    #[instrument(skip(self, cmd), fields(environment = %environment, container = %container))]
    pub async fn exec(
        &self,
        environment: EnvironmentId,
        container: &str,
        cmd: &[&str],
    ) -> Result<ExecOutput> {
        let descriptor = self.environments.resolve(environment).await?;

        let create_payload = Bytes::from(
            serde_json::to_vec(&json!({
                "AttachStdout": true,
                "AttachStderr": true,
                "Tty": false,
                "Cmd": cmd,
            }))
            .map_err(|e| DockhandError::Internal(format!("failed to encode exec body: {e}")))?,
        );
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/containers/{container}/exec"),
                Some(create_payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "container", container)?;
        let created: serde_json::Value = response.json()?;
        let exec_id = created
            .get("Id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                DockhandError::Internal("exec create response missing Id".to_string())
            })?
            .to_string();

        let start_payload = Bytes::from(
            serde_json::to_vec(&json!({ "Detach": false, "Tty": false }))
                .map_err(|e| DockhandError::Internal(format!("failed to encode body: {e}")))?,
        );
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/exec/{exec_id}/start"),
                Some(start_payload),
                LONG_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "exec", &exec_id)?;
        let output = demultiplex(&response.body);

        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/exec/{exec_id}/json"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "exec", &exec_id)?;
        let inspect: serde_json::Value = response.json()?;
        let exit_code = inspect
            .get("ExitCode")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1);

        Ok(ExecOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Resizes a running exec session's TTY. The session itself may live on
    /// the tunnel; resize is plain request/response either way.
    pub async fn resize_exec(
        &self,
        environment: EnvironmentId,
        exec_id: &str,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("w", width.to_string()), ("h", height.to_string())]);
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/exec/{exec_id}/resize{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "exec", exec_id)
    }
}
