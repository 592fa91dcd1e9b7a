//! Serialization and deduplication of vulnerability scans.
//!
//! Two rules, per the scanners' operational constraints:
//! - identical requests (same scanner, image and environment) collapse onto
//!   one in-flight scan; late callers await the first caller's result;
//! - distinct images under the same scanner type run strictly one at a
//!   time, in arrival order, because scanners share a vulnerability
//!   database on disk and its lock. A waiting scan proceeds only after the
//!   prior one releases the lock, success or failure.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use dockhand_common::{
    DockhandError, EnvironmentId, Result, ScanFindings, Scanner, ScannerSettings, SeverityTally,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub scanner: String,
    pub image: String,
    pub environment: EnvironmentId,
}

/// Aggregated outcome of one scan request.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub findings: Vec<ScanFindings>,
    pub tally: SeverityTally,
    /// False when the scanner collaborator returned nothing, meaning no
    /// scanner is configured for the installation.
    pub scanner_configured: bool,
    pub scanned_at: chrono::DateTime<chrono::Utc>,
}

impl ScanReport {
    fn aggregate(findings: Vec<ScanFindings>) -> Self {
        let mut tally = SeverityTally::default();
        for finding in &findings {
            tally.merge(&finding.tally);
        }
        Self {
            scanner_configured: !findings.is_empty(),
            findings,
            tally,
            scanned_at: chrono::Utc::now(),
        }
    }
}

/// Clonable failure so a shared in-flight scan can hand the same error to
/// every caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
struct SharedScanError(String);

type SharedScan = Shared<BoxFuture<'static, std::result::Result<ScanReport, SharedScanError>>>;

struct Inner {
    scanner: Arc<dyn Scanner>,
    settings: ScannerSettings,
    in_flight: Mutex<HashMap<ScanKey, SharedScan>>,
    type_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Inner {
    async fn type_lock(&self, scanner: &str) -> Arc<Mutex<()>> {
        let mut locks = self.type_locks.lock().await;
        locks
            .entry(scanner.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Process-scoped scan coordinator. Cheap to clone.
#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<Inner>,
}

impl ScanCoordinator {
    pub fn new(scanner: Arc<dyn Scanner>, settings: ScannerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                scanner,
                settings,
                in_flight: Mutex::new(HashMap::new()),
                type_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.settings.enabled()
    }

    pub fn settings(&self) -> &ScannerSettings {
        &self.inner.settings
    }

    /// Scans an image, joining an identical in-flight scan if one exists.
    #[instrument(skip(self), fields(image = %image, environment = %environment))]
    pub async fn scan(&self, image: &str, environment: EnvironmentId) -> Result<ScanReport> {
        let key = ScanKey {
            scanner: self
                .inner
                .settings
                .kind
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            image: image.to_string(),
            environment,
        };

        let shared = {
            let mut in_flight = self.inner.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                debug!(image = %key.image, "joining in-flight scan");
                existing.clone()
            } else {
                let fut = Self::run_scan(self.inner.clone(), key.clone())
                    .boxed()
                    .shared();
                in_flight.insert(key.clone(), fut.clone());
                fut
            }
        };

        shared
            .await
            .map_err(|e| DockhandError::Scan(e.to_string()))
    }

    async fn run_scan(
        inner: Arc<Inner>,
        key: ScanKey,
    ) -> std::result::Result<ScanReport, SharedScanError> {
        // Fair mutex: scans of the same scanner type queue FIFO and run
        // mutually exclusively, whatever image they target.
        let lock = inner.type_lock(&key.scanner).await;
        let guard = lock.lock().await;

        info!(scanner = %key.scanner, image = %key.image, "starting vulnerability scan");
        let result = inner.scanner.scan(&key.image, key.environment).await;

        drop(guard);
        inner.in_flight.lock().await.remove(&key);

        match result {
            Ok(findings) => {
                let report = ScanReport::aggregate(findings);
                info!(
                    scanner = %key.scanner,
                    image = %key.image,
                    findings = %report.tally,
                    "scan complete"
                );
                Ok(report)
            }
            Err(e) => Err(SharedScanError(e.to_string())),
        }
    }

    /// Drops completed entries that have not self-removed yet; bounds the
    /// in-flight map during long uptimes.
    pub async fn sweep(&self) {
        let mut in_flight = self.inner.in_flight.lock().await;
        in_flight.retain(|_, shared| shared.peek().is_none());
    }

    pub async fn clear(&self) {
        self.inner.in_flight.lock().await.clear();
        self.inner.type_locks.lock().await.clear();
    }

    pub async fn in_flight_len(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }
}
