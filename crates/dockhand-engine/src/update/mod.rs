//! Safe auto-update pipeline.
//!
//! Per target container: digest comparison without pulling, temp-tag
//! protected pull, vulnerability-scan gating, then handoff to the
//! recreation engine. A gate block is a successful "skipped" outcome; a
//! scan execution failure is a hard failure. The live tag is never left
//! pointing at an unscanned image, even across a crash mid-pipeline.

mod gate;
pub mod scan;

pub use gate::gate_blocks;
pub use scan::{ScanCoordinator, ScanKey, ScanReport};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use dockhand_common::{CleanupReport, EnvironmentId, GatePolicy, Result, SeverityTally};

use crate::client::models::{ContainerInspect, PullProgress};
use crate::client::RuntimeApi;
use crate::recreate::{RecreateOptions, RecreationEngine};
use crate::registry::{encode_daemon_auth, ImageRef, RegistryCredential, RegistryProbe};

/// Suffix appended to the live tag while a candidate sits in quarantine.
const SCAN_TAG_SUFFIX: &str = "-dockhand-scan";

/// Label marking containers the engine itself manages; they are never
/// auto-updated.
pub const SYSTEM_LABEL: &str = "io.dockhand.system";

#[derive(Default)]
pub struct UpdateOptions {
    pub gate: GatePolicy,
    pub credential: Option<RegistryCredential>,
    pub stop_timeout_secs: Option<u32>,
    /// Optional sink for pull progress events.
    pub progress: Option<mpsc::Sender<PullProgress>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The reference pins a digest; updating it would change identity.
    DigestPinned,
    /// Engine-managed or operator-protected container.
    ProtectedContainer,
    /// The image has no registry digest to compare against.
    LocalOnlyImage,
    RegistryUnreachable,
    /// The vulnerability gate tripped; the live tag was left untouched.
    Blocked { tally: SeverityTally },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DigestPinned => write!(f, "image reference is digest-pinned"),
            SkipReason::ProtectedContainer => write!(f, "container is protected"),
            SkipReason::LocalOnlyImage => write!(f, "image exists only locally"),
            SkipReason::RegistryUnreachable => write!(f, "registry unreachable"),
            SkipReason::Blocked { tally } => write!(f, "blocked by vulnerability gate ({tally})"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated {
        container_id: String,
        old_image_id: String,
        new_image_id: String,
    },
    UpToDate,
    Skipped {
        reason: SkipReason,
    },
}

#[derive(Clone)]
pub struct UpdatePipeline {
    api: Arc<dyn RuntimeApi>,
    registry: Arc<dyn RegistryProbe>,
    scans: ScanCoordinator,
    recreation: RecreationEngine,
}

impl UpdatePipeline {
    pub fn new(
        api: Arc<dyn RuntimeApi>,
        registry: Arc<dyn RegistryProbe>,
        scans: ScanCoordinator,
        recreation: RecreationEngine,
    ) -> Self {
        Self {
            api,
            registry,
            scans,
            recreation,
        }
    }

    /// Digest comparison only; answers "is there an update?" without
    /// touching the local image store.
    #[instrument(skip(self, credential), fields(environment = %environment, container = %reference))]
    pub async fn check_for_update(
        &self,
        environment: EnvironmentId,
        reference: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<Option<String>> {
        let snapshot = self.api.inspect_container(environment, reference).await?;
        let image_ref = ImageRef::parse(&snapshot.config.image);
        if image_ref.is_digest_pinned() {
            return Ok(None);
        }

        let local = self
            .api
            .inspect_image(environment, &snapshot.config.image)
            .await?;
        if local.repo_digests.is_empty() {
            return Ok(None);
        }

        let remote = self.registry.manifest_digest(&image_ref, credential).await?;
        if digest_matches_local(&local.repo_digests, &remote) {
            Ok(None)
        } else {
            Ok(Some(remote))
        }
    }

    /// Runs the full pipeline against one container.
    #[instrument(skip(self, options), fields(environment = %environment, container = %reference))]
    pub async fn update_container(
        &self,
        environment: EnvironmentId,
        reference: &str,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let snapshot = self.api.inspect_container(environment, reference).await?;

        if is_protected(&snapshot) {
            return Ok(UpdateOutcome::Skipped {
                reason: SkipReason::ProtectedContainer,
            });
        }

        let image_name = snapshot.config.image.clone();
        let image_ref = ImageRef::parse(&image_name);
        if image_ref.is_digest_pinned() {
            return Ok(UpdateOutcome::Skipped {
                reason: SkipReason::DigestPinned,
            });
        }

        // Compare digests before moving a single byte.
        let local = self.api.inspect_image(environment, &image_name).await?;
        if local.repo_digests.is_empty() {
            info!(image = %image_name, "image has no registry digest, skipping");
            return Ok(UpdateOutcome::Skipped {
                reason: SkipReason::LocalOnlyImage,
            });
        }
        let remote = match self
            .registry
            .manifest_digest(&image_ref, options.credential.as_ref())
            .await
        {
            Ok(digest) => digest,
            Err(e) => {
                warn!(image = %image_name, error = %e, "registry digest probe failed, skipping");
                return Ok(UpdateOutcome::Skipped {
                    reason: SkipReason::RegistryUnreachable,
                });
            }
        };
        if digest_matches_local(&local.repo_digests, &remote) {
            debug!(image = %image_name, digest = %remote, "no update available");
            return Ok(UpdateOutcome::UpToDate);
        }

        let old_image_id = local.id.clone();
        let daemon_auth = options.credential.as_ref().map(encode_daemon_auth);

        let gated = options.gate != GatePolicy::None && self.scans.enabled();
        if !gated {
            // No scanner in play: pull straight onto the live tag.
            self.api
                .pull_image(
                    environment,
                    &image_name,
                    daemon_auth,
                    options.progress.clone(),
                )
                .await?;
            return self
                .finish_with_recreation(environment, reference, &snapshot, &old_image_id, &options)
                .await;
        }

        // Scanner path. The pull lands on the live tag, so the first thing
        // after it is to point the live tag back at the old image: a crash
        // between here and the gate decision must not leave the tag on an
        // unscanned image.
        self.api
            .pull_image(
                environment,
                &image_name,
                daemon_auth,
                options.progress.clone(),
            )
            .await?;

        let candidate = self.api.inspect_image(environment, &image_name).await?;
        let candidate_id = candidate.id.clone();
        if candidate_id == old_image_id {
            return Ok(UpdateOutcome::UpToDate);
        }

        let repo = image_ref.tagged();
        let (repo_name, live_tag) = match repo.rsplit_once(':') {
            Some((r, t)) => (r.to_string(), t.to_string()),
            None => (repo.clone(), "latest".to_string()),
        };
        let temp_tag = format!("{live_tag}{SCAN_TAG_SUFFIX}");
        let temp_ref = format!("{repo_name}:{temp_tag}");

        self.api
            .tag_image(environment, &old_image_id, &repo_name, &live_tag)
            .await?;
        self.api
            .tag_image(environment, &candidate_id, &repo_name, &temp_tag)
            .await?;

        let decision = self
            .scan_and_gate(environment, &temp_ref, &old_image_id, options.gate)
            .await;

        match decision {
            Err(e) => {
                // Hard failure: abort the update, quarantined image removed.
                self.cleanup_temp(environment, &temp_ref, Some(&candidate_id))
                    .await;
                Err(e)
            }
            Ok(Some(tally)) => {
                info!(image = %image_name, findings = %tally, "update blocked by vulnerability gate");
                self.cleanup_temp(environment, &temp_ref, Some(&candidate_id))
                    .await;
                Ok(UpdateOutcome::Skipped {
                    reason: SkipReason::Blocked { tally },
                })
            }
            Ok(None) => {
                // Clean: commit the candidate to the live tag, drop the
                // quarantine tag, recreate onto the new image.
                self.api
                    .tag_image(environment, &candidate_id, &repo_name, &live_tag)
                    .await?;
                self.cleanup_temp(environment, &temp_ref, None).await;
                self.finish_with_recreation(
                    environment,
                    reference,
                    &snapshot,
                    &old_image_id,
                    &options,
                )
                .await
            }
        }
    }

    /// Scans the quarantined candidate and evaluates the gate. Returns the
    /// blocking tally, or `None` when the update may proceed.
    async fn scan_and_gate(
        &self,
        environment: EnvironmentId,
        temp_ref: &str,
        old_image_id: &str,
        gate: GatePolicy,
    ) -> Result<Option<SeverityTally>> {
        let report = self.scans.scan(temp_ref, environment).await?;
        if !report.scanner_configured {
            // Collaborator reported no scanner after all; nothing to gate.
            return Ok(None);
        }

        let baseline = if gate == GatePolicy::MoreThanCurrent {
            match self.scans.scan(old_image_id, environment).await {
                Ok(current) if current.scanner_configured => Some(current.tally),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "could not scan current image for baseline");
                    None
                }
            }
        } else {
            None
        };

        if gate_blocks(gate, &report.tally, baseline.as_ref()) {
            Ok(Some(report.tally))
        } else {
            Ok(None)
        }
    }

    /// Removes the quarantine tag and, when the candidate is being thrown
    /// away, the candidate image itself. Best-effort on every exit path.
    async fn cleanup_temp(
        &self,
        environment: EnvironmentId,
        temp_ref: &str,
        discard_candidate: Option<&str>,
    ) {
        let report = match self.api.remove_image(environment, temp_ref, false).await {
            Ok(()) => CleanupReport::ok(),
            Err(e) => CleanupReport::failed(e),
        };
        if let Some(error) = &report.error {
            warn!(image = %temp_ref, error = %error, "failed to remove quarantine tag");
        }

        if let Some(candidate_id) = discard_candidate {
            let report = match self
                .api
                .remove_image(environment, candidate_id, false)
                .await
            {
                Ok(()) => CleanupReport::ok(),
                Err(e) => CleanupReport::failed(e),
            };
            if let Some(error) = &report.error {
                // Expected when layers are shared with other images.
                debug!(image = %candidate_id, error = %error, "candidate image not removed");
            }
        }
    }

    async fn finish_with_recreation(
        &self,
        environment: EnvironmentId,
        reference: &str,
        snapshot: &ContainerInspect,
        old_image_id: &str,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let new_image = self
            .api
            .inspect_image(environment, &snapshot.config.image)
            .await?;

        let outcome = self
            .recreation
            .recreate(
                environment,
                reference,
                Some(&snapshot.config.image),
                RecreateOptions {
                    stop_timeout_secs: options.stop_timeout_secs,
                },
            )
            .await?;

        info!(
            container = %outcome.name,
            old_image = %old_image_id,
            new_image = %new_image.id,
            "auto-update complete"
        );
        Ok(UpdateOutcome::Updated {
            container_id: outcome.container_id,
            old_image_id: old_image_id.to_string(),
            new_image_id: new_image.id,
        })
    }
}

fn digest_matches_local(repo_digests: &[String], remote: &str) -> bool {
    repo_digests.iter().any(|entry| {
        entry
            .rsplit_once('@')
            .map(|(_, digest)| digest == remote)
            .unwrap_or(false)
    })
}

fn is_protected(snapshot: &ContainerInspect) -> bool {
    let labelled = snapshot
        .config
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SYSTEM_LABEL))
        .is_some_and(|v| v == "true");
    labelled || snapshot.plain_name().starts_with("dockhand-helper-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::models::ContainerConfig;
    use std::collections::HashMap;

    #[test]
    fn test_digest_matches_local() {
        let digests = vec![
            "nginx@sha256:aaa".to_string(),
            "mirror.local/nginx@sha256:bbb".to_string(),
        ];
        assert!(digest_matches_local(&digests, "sha256:aaa"));
        assert!(digest_matches_local(&digests, "sha256:bbb"));
        assert!(!digest_matches_local(&digests, "sha256:ccc"));
        assert!(!digest_matches_local(&[], "sha256:aaa"));
    }

    #[test]
    fn test_protected_detection() {
        let labelled = ContainerInspect {
            name: "/web".to_string(),
            config: ContainerConfig {
                labels: Some(HashMap::from([(
                    SYSTEM_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(is_protected(&labelled));

        let helper = ContainerInspect {
            name: "/dockhand-helper-ab12cd34".to_string(),
            ..Default::default()
        };
        assert!(is_protected(&helper));

        let plain = ContainerInspect {
            name: "/web".to_string(),
            ..Default::default()
        };
        assert!(!is_protected(&plain));
    }
}
