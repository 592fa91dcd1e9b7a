//! Registry v2 authentication and manifest probing.
//!
//! Runs over its own reqwest client, separate from the runtime API
//! transport: the registry is a normal public HTTPS endpoint, not part of
//! any managed environment. Per the degradation policy, anything unexpected
//! during the auth probe means "no credentials usable", never a hard
//! failure; update checking then proceeds unauthenticated and fails (or
//! not) on the actual manifest request.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, instrument};

use dockhand_common::{DockhandError, Result};

const HUB_HOSTS: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Stored registry credential. `host` may carry an organization path
/// (`ghcr.io/acme`), restricting it to references under that path.
#[derive(Debug, Clone)]
pub struct RegistryCredential {
    pub host: String,
    pub username: String,
    pub password: String,
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub host: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parses `[host/]repo[:tag][@digest]` the way the runtime does:
    /// the first segment is a registry host only if it looks like one.
    pub fn parse(reference: &str) -> Self {
        let (remainder, digest) = match reference.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (reference, None),
        };

        let (name, tag) = match remainder.rfind(':') {
            Some(colon) if !remainder[colon..].contains('/') => (
                &remainder[..colon],
                remainder[colon + 1..].to_string(),
            ),
            _ => (remainder, "latest".to_string()),
        };

        let (host, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => {
                // Hub reference; bare names live under `library/`.
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{name}")
                };
                ("docker.io".to_string(), repository)
            }
        };

        Self {
            host,
            repository,
            tag,
            digest,
        }
    }

    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Host the registry API actually answers on.
    pub fn api_host(&self) -> &str {
        if is_hub_host(&self.host) {
            "registry-1.docker.io"
        } else {
            &self.host
        }
    }

    /// `repo:tag` form addressed to the local daemon (no digest).
    pub fn tagged(&self) -> String {
        if is_hub_host(&self.host) {
            let repo = self
                .repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository);
            format!("{repo}:{}", self.tag)
        } else {
            format!("{}/{}:{}", self.host, self.repository, self.tag)
        }
    }
}

fn is_hub_host(host: &str) -> bool {
    HUB_HOSTS.contains(&host)
}

/// Whether a stored credential applies to an image reference. Docker-Hub
/// host spellings are equivalent, and a host-only credential satisfies any
/// organization path under that host.
pub fn credential_matches(credential_host: &str, image: &ImageRef) -> bool {
    let (cred_host, cred_path) = match credential_host.split_once('/') {
        Some((host, path)) => (host, Some(path.trim_end_matches('/'))),
        None => (credential_host, None),
    };

    let hosts_equal = if is_hub_host(cred_host) {
        is_hub_host(&image.host)
    } else {
        cred_host.eq_ignore_ascii_case(&image.host)
    };
    if !hosts_equal {
        return false;
    }

    match cred_path {
        None | Some("") => true,
        Some(path) => {
            image.repository == path || image.repository.starts_with(&format!("{path}/"))
        }
    }
}

/// Encodes a credential for the daemon's `X-Registry-Auth` header.
pub fn encode_daemon_auth(credential: &RegistryCredential) -> String {
    let payload = serde_json::json!({
        "username": credential.username,
        "password": credential.password,
        "serveraddress": credential.host,
    });
    base64::engine::general_purpose::STANDARD.encode(payload.to_string())
}

#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer { realm: String, service: Option<String> },
}

/// Parses a `WWW-Authenticate` challenge line.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    if header.len() >= 5 && header[..5].eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    let params = header.strip_prefix("Bearer").or_else(|| header.strip_prefix("bearer"))?;

    let mut realm = None;
    let mut service = None;
    for part in split_challenge_params(params) {
        let (key, value) = part.split_once('=')?;
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    Some(Challenge::Bearer {
        realm: realm?,
        service,
    })
}

/// Splits challenge parameters on commas outside quotes.
fn split_challenge_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = params[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// The one registry question the update pipeline asks: what digest does a
/// reference resolve to right now? A trait so tests can script registries.
#[async_trait]
pub trait RegistryProbe: Send + Sync {
    async fn manifest_digest(
        &self,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Result<String>;
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Client for registry-side operations: the bearer challenge flow and
/// digest probing without pulling.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Resolves the `Authorization` header value for registry API calls
    /// against an image's repository, if any is needed and obtainable.
    #[instrument(skip(self, credential), fields(host = %image.api_host(), repository = %image.repository))]
    pub async fn resolve_auth(
        &self,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Option<String> {
        let credential = credential.filter(|c| credential_matches(&c.host, image));
        let probe_url = format!("https://{}/v2/", image.api_host());

        let probe = match self.http.get(&probe_url).send().await {
            Ok(probe) => probe,
            Err(e) => {
                debug!(error = %e, "registry probe failed, proceeding unauthenticated");
                return None;
            }
        };

        match probe.status().as_u16() {
            200 => None,
            401 => {
                let challenge = probe
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_challenge)?;
                match challenge {
                    Challenge::Basic => {
                        let credential = credential?;
                        let raw = format!("{}:{}", credential.username, credential.password);
                        Some(format!(
                            "Basic {}",
                            base64::engine::general_purpose::STANDARD.encode(raw)
                        ))
                    }
                    Challenge::Bearer { realm, service } => {
                        self.request_token(&realm, service.as_deref(), image, credential)
                            .await
                    }
                }
            }
            status => {
                debug!(status, "unexpected registry probe status, proceeding unauthenticated");
                None
            }
        }
    }

    async fn request_token(
        &self,
        realm: &str,
        service: Option<&str>,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Option<String> {
        let scope = format!("repository:{}:pull", image.repository);
        let mut request = self.http.get(realm).query(&[("scope", scope.as_str())]);
        if let Some(service) = service {
            request = request.query(&[("service", service)]);
        }
        if let Some(credential) = credential {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "token endpoint refused, proceeding unauthenticated");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "token endpoint unreachable, proceeding unauthenticated");
                return None;
            }
        };

        let token: TokenResponse = response.json().await.ok()?;
        token
            .token
            .or(token.access_token)
            .map(|t| format!("Bearer {t}"))
    }

    /// Fetches the manifest digest for a reference via HEAD, without
    /// transferring the manifest body.
    #[instrument(skip(self, credential), fields(host = %image.api_host(), repository = %image.repository, tag = %image.tag))]
    pub async fn manifest_digest(
        &self,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Result<String> {
        let auth = self.resolve_auth(image, credential).await;
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            image.api_host(),
            image.repository,
            image.tag
        );

        let mut request = self
            .http
            .head(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
        if let Some(auth) = auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DockhandError::Registry(format!("registry unreachable: {e}")))?;

        match response.status().as_u16() {
            200 => response
                .headers()
                .get("Docker-Content-Digest")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    DockhandError::Registry("manifest response carried no digest".to_string())
                }),
            404 => Err(DockhandError::NotFound {
                kind: "manifest",
                name: format!("{}:{}", image.repository, image.tag),
            }),
            status => Err(DockhandError::Registry(format!(
                "manifest probe returned status {status}"
            ))),
        }
    }
}

#[async_trait]
impl RegistryProbe for RegistryClient {
    async fn manifest_digest(
        &self,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Result<String> {
        RegistryClient::manifest_digest(self, image, credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hub_reference() {
        let image = ImageRef::parse("nginx:1.27");
        assert_eq!(image.host, "docker.io");
        assert_eq!(image.repository, "library/nginx");
        assert_eq!(image.tag, "1.27");
        assert_eq!(image.api_host(), "registry-1.docker.io");
        assert_eq!(image.tagged(), "nginx:1.27");
    }

    #[test]
    fn test_parse_org_and_custom_registry() {
        let image = ImageRef::parse("acme/app");
        assert_eq!(image.host, "docker.io");
        assert_eq!(image.repository, "acme/app");
        assert_eq!(image.tag, "latest");

        let image = ImageRef::parse("registry.example.com:5000/team/app:v2");
        assert_eq!(image.host, "registry.example.com:5000");
        assert_eq!(image.repository, "team/app");
        assert_eq!(image.tag, "v2");
        assert_eq!(image.tagged(), "registry.example.com:5000/team/app:v2");
    }

    #[test]
    fn test_parse_digest_pin() {
        let image = ImageRef::parse("ghcr.io/acme/app@sha256:deadbeef");
        assert!(image.is_digest_pinned());
        assert_eq!(image.repository, "acme/app");
    }

    #[test]
    fn test_hub_host_variants_are_equivalent() {
        let image = ImageRef::parse("nginx");
        assert!(credential_matches("docker.io", &image));
        assert!(credential_matches("index.docker.io", &image));
        assert!(credential_matches("registry-1.docker.io", &image));
        assert!(!credential_matches("ghcr.io", &image));
    }

    #[test]
    fn test_host_only_credential_covers_org_paths() {
        let image = ImageRef::parse("ghcr.io/acme/tools/app:1.0");
        assert!(credential_matches("ghcr.io", &image));
        assert!(credential_matches("ghcr.io/acme", &image));
        assert!(credential_matches("ghcr.io/acme/tools", &image));
        assert!(!credential_matches("ghcr.io/other", &image));
        // Path prefix must fall on a segment boundary.
        assert!(!credential_matches("ghcr.io/ac", &image));
    }

    #[test]
    fn test_parse_challenge_bearer() {
        let challenge = parse_challenge(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
        )
        .unwrap();
        match challenge {
            Challenge::Bearer { realm, service } => {
                assert_eq!(realm, "https://auth.docker.io/token");
                assert_eq!(service.as_deref(), Some("registry.docker.io"));
            }
            Challenge::Basic => panic!("expected bearer"),
        }
    }

    #[test]
    fn test_parse_challenge_basic_and_garbage() {
        assert_eq!(
            parse_challenge("Basic realm=\"registry\""),
            Some(Challenge::Basic)
        );
        assert_eq!(parse_challenge("Negotiate"), None);
    }

    #[test]
    fn test_encode_daemon_auth_is_base64_json() {
        let credential = RegistryCredential {
            host: "ghcr.io".to_string(),
            username: "bot".to_string(),
            password: "hunter2".to_string(),
        };
        let encoded = encode_daemon_auth(&credential);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["username"], "bot");
        assert_eq!(value["serveraddress"], "ghcr.io");
    }
}
