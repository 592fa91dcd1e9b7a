use http::{HeaderMap, Method};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use dockhand_common::{DockhandError, EnvironmentId, Result};

use super::http::{encode_query, ensure_status, DEFAULT_TIMEOUT};
use super::models::{ImageInspect, ImageSummary, PullProgress};
use super::RuntimeClient;

impl RuntimeClient {
    pub async fn list_images(&self, environment: EnvironmentId) -> Result<Vec<ImageSummary>> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(&descriptor, Method::GET, "/images/json", None, DEFAULT_TIMEOUT)
            .await?;
        ensure_status(&response, "image", "list")?;
        response.json()
    }

    pub async fn inspect_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<ImageInspect> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/images/{reference}/json"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "image", reference)?;
        response.json()
    }

    /// Pulls an image, consuming the daemon's progress stream to completion.
    /// Progress events are forwarded best-effort; a slow or dropped consumer
    /// never stalls the pull.
    #[instrument(skip(self, auth, progress), fields(environment = %environment, image = %reference))]
    pub async fn pull_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
        auth: Option<String>,
        progress: Option<mpsc::Sender<PullProgress>>,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;

        let (from_image, tag) = split_reference(reference);
        let query = encode_query(&[("fromImage", from_image.to_string()), ("tag", tag.to_string())]);

        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            if let Ok(value) = http::header::HeaderValue::try_from(auth) {
                headers.insert("X-Registry-Auth", value);
            }
        }

        let mut stream = self
            .invoke_stream(
                &descriptor,
                Method::POST,
                &format!("/images/create{query}"),
                None,
                Some(headers),
            )
            .await?;

        if !stream.status.is_success() {
            // Collect what the daemon sent so the error has its message.
            let mut body = Vec::new();
            while let Some(Ok(chunk)) = stream.chunks.recv().await {
                body.extend_from_slice(&chunk);
            }
            if stream.status.as_u16() == 404 {
                return Err(DockhandError::NotFound {
                    kind: "image",
                    name: reference.to_string(),
                });
            }
            return Err(DockhandError::Api {
                status: stream.status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        // The stream is newline-delimited JSON progress events; an `error`
        // field aborts the pull.
        let mut pending = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            let chunk = chunk?;
            pending.extend_from_slice(&chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if let Some(event) = parse_progress_line(&line) {
                    if let Some(error) = &event.error {
                        return Err(DockhandError::Registry(format!(
                            "pull of {reference} failed: {error}"
                        )));
                    }
                    if let Some(sender) = &progress {
                        let _ = sender.try_send(event);
                    }
                }
            }
        }
        if let Some(event) = parse_progress_line(&pending) {
            if let Some(error) = &event.error {
                return Err(DockhandError::Registry(format!(
                    "pull of {reference} failed: {error}"
                )));
            }
            if let Some(sender) = &progress {
                let _ = sender.try_send(event);
            }
        }

        debug!(image = %reference, "pull complete");
        Ok(())
    }

    /// Layer history of an image, newest first, as the runtime reports it.
    pub async fn image_history(
        &self,
        environment: EnvironmentId,
        reference: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let descriptor = self.environments.resolve(environment).await?;
        let response = self
            .invoke(
                &descriptor,
                Method::GET,
                &format!("/images/{reference}/history"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "image", reference)?;
        response.json()
    }

    pub async fn tag_image(
        &self,
        environment: EnvironmentId,
        source: &str,
        repo: &str,
        tag: &str,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("repo", repo.to_string()), ("tag", tag.to_string())]);
        let response = self
            .invoke(
                &descriptor,
                Method::POST,
                &format!("/images/{source}/tag{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "image", source)
    }

    pub async fn remove_image(
        &self,
        environment: EnvironmentId,
        reference: &str,
        force: bool,
    ) -> Result<()> {
        let descriptor = self.environments.resolve(environment).await?;
        let query = encode_query(&[("force", force.to_string())]);
        let response = self
            .invoke(
                &descriptor,
                Method::DELETE,
                &format!("/images/{reference}{query}"),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        ensure_status(&response, "image", reference)
    }
}

/// Splits `repo[:tag]` into its parts, defaulting the tag to `latest`.
/// A digest reference (`repo@sha256:...`) keeps the digest as the "tag".
fn split_reference(reference: &str) -> (&str, &str) {
    if let Some(at) = reference.find('@') {
        return (&reference[..at], &reference[at + 1..]);
    }
    match reference.rfind(':') {
        // A colon before the last slash is a registry port, not a tag.
        Some(colon) if !reference[colon..].contains('/') => {
            (&reference[..colon], &reference[colon + 1..])
        }
        _ => (reference, "latest"),
    }
}

fn parse_progress_line(line: &[u8]) -> Option<PullProgress> {
    let trimmed: &[u8] = {
        let s = line;
        let start = s.iter().position(|b| !b.is_ascii_whitespace())?;
        let end = s.iter().rposition(|b| !b.is_ascii_whitespace())?;
        &s[start..=end]
    };
    serde_json::from_slice(trimmed).ok()
}
