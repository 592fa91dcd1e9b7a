use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{EnvironmentId, Result};

/// Response returned by the tunnel collaborator for a unary request.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub is_binary: bool,
}

/// Tunneled request/response transport for environments behind NAT or a
/// firewall. The tunnel's wire protocol (handshake, heartbeat, request
/// correlation, interactive sessions) lives with the collaborator; the
/// engine only consumes these contracts.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn send_request(
        &self,
        environment: EnvironmentId,
        method: &str,
        path: &str,
        body: Option<Bytes>,
        headers: Option<HashMap<String, String>>,
        streaming: bool,
        timeout: Duration,
    ) -> Result<TunnelResponse>;

    /// Streaming variant: body chunks are delivered through `sink` until the
    /// remote side ends the stream; the call returns once the stream closes.
    async fn send_stream_request(
        &self,
        environment: EnvironmentId,
        method: &str,
        path: &str,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<()>;

    async fn is_connected(&self, environment: EnvironmentId) -> bool;
}
