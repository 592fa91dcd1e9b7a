// Re-export dependencies used in public interfaces of common types

use std::time::Duration;

use thiserror::Error;
pub use uuid;
pub use uuid::Uuid;

pub mod config;
pub mod environment;
pub mod scan;
pub mod tunnel;

pub use config::{GatePolicy, ScannerSettings};
pub use environment::{Environment, EnvironmentId, EnvironmentProvider, TlsMaterial, TransportKind};
pub use scan::{ScanFindings, Scanner, Severity, SeverityTally};
pub use tunnel::{TunnelResponse, TunnelTransport};

/// Closed set of user-facing transport failure causes. The original error is
/// retained for diagnostics; nothing at this level is retried.
#[derive(Error, Debug)]
pub enum TransportFault {
    #[error("runtime socket unreachable")]
    SocketUnreachable(#[source] std::io::Error),

    #[error("connection reset by the runtime")]
    ConnectionReset(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("host could not be resolved: {0}")]
    HostUnresolved(String),

    #[error("host unreachable: {host}")]
    HostUnreachable {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum DockhandError {
    #[error(transparent)]
    Transport(#[from] TransportFault),

    /// 404-style responses, typed distinctly so callers can map them.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("runtime API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("recreation failed: {0}")]
    Recreation(String),

    #[error("update failed: {0}")]
    Update(String),

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DockhandError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockhandError::NotFound { .. })
    }
}

// Define the primary Result type for engine operations
pub type Result<T> = std::result::Result<T, DockhandError>;

/// Outcome of a best-effort cleanup step. Logged by the caller, never
/// propagated, so a failed cleanup cannot obscure the root cause.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub attempted: bool,
    pub error: Option<String>,
}

impl CleanupReport {
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn ok() -> Self {
        Self {
            attempted: true,
            error: None,
        }
    }

    pub fn failed(err: impl ToString) -> Self {
        Self {
            attempted: true,
            error: Some(err.to_string()),
        }
    }
}
