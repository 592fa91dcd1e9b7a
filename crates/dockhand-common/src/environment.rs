use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

pub type EnvironmentId = Uuid;

/// How the runtime API for an environment is reached on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Local Unix socket.
    Socket,
    /// Direct TCP, optionally with (mutual) TLS.
    DirectTcp,
    /// Agent-initiated tunnel, standard deployment.
    TunnelStandard,
    /// Agent-initiated tunnel, edge deployment behind NAT/firewall.
    TunnelEdge,
}

impl TransportKind {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, TransportKind::TunnelStandard | TransportKind::TunnelEdge)
    }
}

/// PEM material for TLS-secured direct TCP environments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub ca_pem: Option<String>,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    #[serde(default)]
    pub skip_verify: bool,
}

impl TlsMaterial {
    /// Mutual TLS requires both a client certificate and its key.
    pub fn is_mutual(&self) -> bool {
        self.cert_pem.is_some() && self.key_pem.is_some()
    }
}

/// A named endpoint the engine can target. Created and edited externally;
/// the engine only ever reads these through the environment cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    pub kind: TransportKind,
    pub socket_path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsMaterial>,
    /// Credential presented by the tunnel agent; opaque to the engine.
    pub tunnel_token: Option<String>,
}

impl Environment {
    pub fn local_socket(id: EnvironmentId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: TransportKind::Socket,
            socket_path: Some(path.into()),
            host: None,
            port: None,
            tls: None,
            tunnel_token: None,
        }
    }
}

/// Backing store for environment records. The store itself (database, file,
/// whatever the host application uses) is out of scope.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn fetch(&self, id: EnvironmentId) -> Result<Environment>;
}
