//! Resolution of logical environments into concrete wire paths.
//!
//! Environment records are read through a bounded-TTL cache; connection
//! descriptors are derived from the cached record per request and never
//! stored anywhere.

pub mod tls;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use dockhand_common::{
    DockhandError, Environment, EnvironmentId, EnvironmentProvider, Result, TransportKind,
};

use self::tls::{ClientTls, TlsConfigCache};

/// How long a fetched environment record stays valid without a re-read.
pub const ENVIRONMENT_TTL: Duration = Duration::from_secs(30 * 60);

/// Ephemeral projection of an environment into exactly what the dialer
/// needs. Recomputed from the cached environment for every request.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    pub environment: EnvironmentId,
    pub environment_name: String,
    pub target: ConnectionTarget,
}

#[derive(Clone)]
pub enum ConnectionTarget {
    UnixSocket { path: PathBuf },
    Tcp { host: String, port: u16, tls: Option<ClientTls> },
    Tunnel,
}

impl ConnectionTarget {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, ConnectionTarget::Tunnel)
    }
}

struct CachedEnvironment {
    environment: Environment,
    fetched_at: Instant,
}

/// Read-through cache of environment records with explicit invalidation.
/// Process-scoped: construct once at startup, `sweep` periodically, `clear`
/// in tests.
pub struct EnvironmentCache {
    provider: Arc<dyn EnvironmentProvider>,
    entries: DashMap<EnvironmentId, CachedEnvironment>,
    ttl: Duration,
    tls: TlsConfigCache,
}

impl EnvironmentCache {
    pub fn new(provider: Arc<dyn EnvironmentProvider>) -> Self {
        Self::with_ttl(provider, ENVIRONMENT_TTL)
    }

    pub fn with_ttl(provider: Arc<dyn EnvironmentProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            entries: DashMap::new(),
            ttl,
            tls: TlsConfigCache::new(),
        }
    }

    pub async fn get(&self, id: EnvironmentId) -> Result<Environment> {
        if let Some(entry) = self.entries.get(&id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.environment.clone());
            }
        }

        debug!(environment = %id, "environment cache miss, fetching from provider");
        let environment = self.provider.fetch(id).await?;
        self.entries.insert(
            id,
            CachedEnvironment {
                environment: environment.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(environment)
    }

    /// Drops the cached record (and any TLS state) after an external edit.
    pub fn invalidate(&self, id: EnvironmentId) {
        info!(environment = %id, "invalidating cached environment");
        self.entries.remove(&id);
        self.tls.invalidate(id);
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.tls.clear();
    }

    /// Removes expired entries; callers own the interval timer.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Projects the cached environment into a connection descriptor.
    pub async fn resolve(&self, id: EnvironmentId) -> Result<ConnectionDescriptor> {
        let environment = self.get(id).await?;
        let target = match environment.kind {
            TransportKind::Socket => {
                let path = environment.socket_path.clone().ok_or_else(|| {
                    DockhandError::Environment(format!(
                        "environment {} has no socket path",
                        environment.name
                    ))
                })?;
                ConnectionTarget::UnixSocket { path: path.into() }
            }
            TransportKind::DirectTcp => {
                let host = environment.host.clone().ok_or_else(|| {
                    DockhandError::Environment(format!(
                        "environment {} has no host",
                        environment.name
                    ))
                })?;
                let port = environment.port.unwrap_or(2375);
                let tls = match &environment.tls {
                    Some(material) => Some(self.tls.get(id, material)?),
                    None => None,
                };
                ConnectionTarget::Tcp { host, port, tls }
            }
            TransportKind::TunnelStandard | TransportKind::TunnelEdge => ConnectionTarget::Tunnel,
        };

        Ok(ConnectionDescriptor {
            environment: id,
            environment_name: environment.name,
            target,
        })
    }
}
