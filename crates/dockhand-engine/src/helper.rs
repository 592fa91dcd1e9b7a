//! Ephemeral helper containers for browsing and exporting volumes.
//!
//! A volume's contents are only reachable through a container that mounts
//! it, so browse requests spin up a minimal helper and keep it around for a
//! short TTL to absorb bursts of requests. Exactly one helper exists per
//! (volume, mode, environment) at any time; records refresh on access and
//! the sweep removes both the record and its container once expired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use dockhand_common::{CleanupReport, EnvironmentId, Result};

use crate::client::models::{ContainerConfig, CreateContainerBody, HostConfig};
use crate::client::RuntimeApi;
use crate::update::SYSTEM_LABEL;

const HELPER_TTL: Duration = Duration::from_secs(5 * 60);
const HELPER_IMAGE: &str = "busybox:stable";
const HELPER_MOUNT_PATH: &str = "/dockhand/volume";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperMode {
    /// Read-only browsing and export.
    Read,
    /// Write access, for uploads into the volume.
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HelperKey {
    pub volume: String,
    pub mode: HelperMode,
    pub environment: EnvironmentId,
}

#[derive(Debug, Clone)]
pub struct HelperRecord {
    pub container_id: String,
    expires_at: Instant,
}

/// Process-scoped cache of live helper containers.
pub struct HelperContainers {
    api: Arc<dyn RuntimeApi>,
    image: String,
    ttl: Duration,
    // One lock over the whole map: creation must be mutually exclusive per
    // key, and the map is tiny.
    records: Mutex<HashMap<HelperKey, HelperRecord>>,
}

impl HelperContainers {
    pub fn new(api: Arc<dyn RuntimeApi>) -> Self {
        Self::with_settings(api, HELPER_IMAGE.to_string(), HELPER_TTL)
    }

    pub fn with_settings(api: Arc<dyn RuntimeApi>, image: String, ttl: Duration) -> Self {
        Self {
            api,
            image,
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the helper container for a key, creating it on first use and
    /// refreshing its expiry on every access. The mount path inside the
    /// helper is [`HELPER_MOUNT_PATH`].
    #[instrument(skip(self), fields(volume = %key.volume, environment = %key.environment))]
    pub async fn acquire(&self, key: HelperKey) -> Result<HelperRecord> {
        let mut records = self.records.lock().await;

        if let Some(record) = records.get_mut(&key) {
            // Verify the container still exists; a pruned helper leaves a
            // stale record behind.
            match self
                .api
                .inspect_container(key.environment, &record.container_id)
                .await
            {
                Ok(_) => {
                    record.expires_at = Instant::now() + self.ttl;
                    debug!(container = %record.container_id, "reusing helper container");
                    return Ok(record.clone());
                }
                Err(e) if e.is_not_found() => {
                    debug!(container = %record.container_id, "helper container vanished, recreating");
                    records.remove(&key);
                }
                Err(e) => return Err(e),
            }
        }

        let record = self.create_helper(&key).await?;
        records.insert(key, record.clone());
        Ok(record)
    }

    /// Removes the record and its container immediately.
    pub async fn release(&self, key: &HelperKey) {
        let record = self.records.lock().await.remove(key);
        if let Some(record) = record {
            self.remove_helper(key.environment, &record.container_id)
                .await;
        }
    }

    /// Drops expired records and their containers; callers own the interval
    /// timer.
    pub async fn sweep(&self) {
        let expired: Vec<(HelperKey, HelperRecord)> = {
            let mut records = self.records.lock().await;
            let now = Instant::now();
            let keys: Vec<HelperKey> = records
                .iter()
                .filter(|(_, record)| record.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| records.remove(&key).map(|record| (key, record)))
                .collect()
        };

        for (key, record) in expired {
            info!(volume = %key.volume, container = %record.container_id, "expiring helper container");
            self.remove_helper(key.environment, &record.container_id)
                .await;
        }
    }

    /// Removes every record and container. For shutdown and tests.
    pub async fn clear(&self) {
        let drained: Vec<(HelperKey, HelperRecord)> =
            self.records.lock().await.drain().collect();
        for (key, record) in drained {
            self.remove_helper(key.environment, &record.container_id)
                .await;
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    async fn create_helper(&self, key: &HelperKey) -> Result<HelperRecord> {
        let name = format!("dockhand-helper-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let bind = match key.mode {
            HelperMode::Read => format!("{}:{HELPER_MOUNT_PATH}:ro", key.volume),
            HelperMode::Write => format!("{}:{HELPER_MOUNT_PATH}", key.volume),
        };

        let body = CreateContainerBody {
            config: ContainerConfig {
                image: self.image.clone(),
                cmd: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "sleep 3600".to_string(),
                ]),
                labels: Some(HashMap::from([
                    (SYSTEM_LABEL.to_string(), "true".to_string()),
                    ("io.dockhand.helper.volume".to_string(), key.volume.clone()),
                ])),
                ..Default::default()
            },
            host_config: HostConfig {
                binds: Some(vec![bind]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            },
            networking_config: None,
        };

        let container_id = self
            .api
            .create_container(key.environment, &name, body)
            .await?;
        self.api
            .start_container(key.environment, &container_id)
            .await?;

        info!(volume = %key.volume, container = %container_id, "created helper container");
        Ok(HelperRecord {
            container_id,
            expires_at: Instant::now() + self.ttl,
        })
    }

    async fn remove_helper(&self, environment: EnvironmentId, container_id: &str) {
        let report = match self
            .api
            .remove_container(environment, container_id, true, false)
            .await
        {
            Ok(()) => CleanupReport::ok(),
            Err(e) if e.is_not_found() => CleanupReport::skipped(),
            Err(e) => CleanupReport::failed(e),
        };
        if let Some(error) = &report.error {
            warn!(container = %container_id, error = %error, "failed to remove helper container");
        }
    }
}
