//! Low-level request execution against a resolved environment.
//!
//! One request rides one dialed connection: Unix socket, plain TCP,
//! TLS-wrapped TCP, or the tunnel collaborator. Every request carries a
//! deadline, failures are folded into the closed transport-fault taxonomy
//! with the original error retained, and response bodies are always read to
//! the end before a connection is discarded.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use dockhand_common::{DockhandError, Result, TransportFault, TunnelTransport};

use crate::transport::{ConnectionDescriptor, ConnectionTarget};

use super::RuntimeClient;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for declared long-running operations: pulls, pushes, waits and
/// streaming endpoints.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(300);

/// Fully buffered response to a unary API call.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            DockhandError::Internal(format!("malformed runtime API response: {e}"))
        })
    }
}

/// Server-to-client body stream for logs, pulls and attach output.
pub struct ApiStream {
    pub status: StatusCode,
    pub chunks: mpsc::Receiver<Result<Bytes>>,
}

trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

type BoxedStream = Box<dyn RawStream>;

impl RuntimeClient {
    /// Issues a unary request and buffers the full response body. Non-2xx
    /// statuses are returned, not raised; callers map them with
    /// [`ensure_status`].
    pub(crate) async fn invoke(
        &self,
        descriptor: &ConnectionDescriptor,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> Result<ApiResponse> {
        if descriptor.target.is_tunnel() {
            return self
                .invoke_tunneled(descriptor, method, path_and_query, body, timeout)
                .await;
        }

        let fut = self.invoke_direct(descriptor, method, path_and_query, body);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportFault::Timeout(timeout).into()),
        }
    }

    async fn invoke_direct(
        &self,
        descriptor: &ConnectionDescriptor,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> Result<ApiResponse> {
        let stream = dial(descriptor).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| DockhandError::Transport(map_hyper_error(e)))?;

        let conn_task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "runtime API connection closed with error");
            }
        });

        let request = build_request(descriptor, method, path_and_query, body, None)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| DockhandError::Transport(map_hyper_error(e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = collect_body(response.into_body()).await?;

        drop(sender);
        conn_task.abort();

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn invoke_tunneled(
        &self,
        descriptor: &ConnectionDescriptor,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> Result<ApiResponse> {
        let tunnel = self.tunnel.as_ref().ok_or_else(|| {
            DockhandError::Environment(format!(
                "environment {} requires a tunnel transport but none is configured",
                descriptor.environment_name
            ))
        })?;
        ensure_tunnel_connected(tunnel.as_ref(), descriptor).await?;

        let mut headers = HashMap::new();
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        let response = tunnel
            .send_request(
                descriptor.environment,
                method.as_str(),
                path_and_query,
                body,
                Some(headers),
                false,
                timeout,
            )
            .await?;

        let status = StatusCode::from_u16(response.status).map_err(|_| {
            DockhandError::Internal(format!("tunnel returned invalid status {}", response.status))
        })?;

        let mut header_map = HeaderMap::new();
        for (name, value) in &response.headers {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(name.as_str()),
                http::header::HeaderValue::try_from(value.as_str()),
            ) {
                header_map.insert(name, value);
            }
        }

        Ok(ApiResponse {
            status,
            headers: header_map,
            body: response.body,
        })
    }

    /// Issues a request whose response body is consumed incrementally.
    /// Chunks arrive on the returned channel; the pump drains the body to
    /// completion even if the receiver goes away first.
    pub(crate) async fn invoke_stream(
        &self,
        descriptor: &ConnectionDescriptor,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<ApiStream> {
        let deadline = tokio::time::Instant::now() + LONG_TIMEOUT;

        if descriptor.target.is_tunnel() {
            let tunnel = self.tunnel.as_ref().ok_or_else(|| {
                DockhandError::Environment(format!(
                    "environment {} requires a tunnel transport but none is configured",
                    descriptor.environment_name
                ))
            })?;
            ensure_tunnel_connected(tunnel.as_ref(), descriptor).await?;

            let (raw_tx, mut raw_rx) = mpsc::channel::<Bytes>(16);
            let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
            let environment = descriptor.environment;
            let method = method.to_string();
            let path = path_and_query.to_string();
            let tunnel = tunnel.clone();

            tokio::spawn(async move {
                let pump = async {
                    while let Some(chunk) = raw_rx.recv().await {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Receiver gone; keep draining the tunnel stream.
                            while raw_rx.recv().await.is_some() {}
                            break;
                        }
                    }
                };
                let send = tunnel.send_stream_request(environment, &method, &path, raw_tx);
                let (_, send_result) = tokio::join!(pump, send);
                if let Err(e) = send_result {
                    warn!(error = %e, "tunnel stream request failed");
                }
            });

            return Ok(ApiStream {
                status: StatusCode::OK,
                chunks: rx,
            });
        }

        let connect = async {
            let stream = dial(descriptor).await?;
            let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| DockhandError::Transport(map_hyper_error(e)))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "runtime API stream connection closed with error");
                }
            });

            let request = build_request(descriptor, method, path_and_query, body, extra_headers.as_ref())?;
            sender
                .send_request(request)
                .await
                .map_err(|e| DockhandError::Transport(map_hyper_error(e)))
                .map(|response| (sender, response))
        };

        let (sender, response) = tokio::time::timeout(DEFAULT_TIMEOUT, connect)
            .await
            .map_err(|_| DockhandError::from(TransportFault::Timeout(DEFAULT_TIMEOUT)))??;

        let status = response.status();
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
        let mut incoming = response.into_body();

        tokio::spawn(async move {
            // Keep the request handle alive for the lifetime of the body.
            let _sender = sender;
            let mut receiver_gone = false;
            loop {
                // The deadline covers the whole stream, including a peer
                // that goes silent mid-body.
                let frame = match tokio::time::timeout_at(deadline, incoming.frame()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        if !receiver_gone {
                            let _ = tx
                                .send(Err(TransportFault::Timeout(LONG_TIMEOUT).into()))
                                .await;
                        }
                        break;
                    }
                };
                match frame {
                    Some(Ok(frame)) => {
                        if receiver_gone {
                            continue; // drain to completion
                        }
                        if let Ok(data) = frame.into_data() {
                            if tx.send(Ok(data)).await.is_err() {
                                receiver_gone = true;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        if !receiver_gone {
                            let _ = tx
                                .send(Err(DockhandError::Transport(map_hyper_error(e))))
                                .await;
                        }
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(ApiStream { status, chunks: rx })
    }
}

/// A tunnel request against a disconnected agent would only time out after
/// the full deadline; the connectivity check fails it immediately instead.
async fn ensure_tunnel_connected(
    tunnel: &dyn TunnelTransport,
    descriptor: &ConnectionDescriptor,
) -> Result<()> {
    if tunnel.is_connected(descriptor.environment).await {
        return Ok(());
    }
    Err(TransportFault::HostUnreachable {
        host: descriptor.environment_name.clone(),
        source: std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "tunnel agent is not connected",
        ),
    }
    .into())
}

async fn dial(descriptor: &ConnectionDescriptor) -> Result<BoxedStream> {
    match &descriptor.target {
        ConnectionTarget::UnixSocket { path } => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(TransportFault::SocketUnreachable)?;
            Ok(Box::new(stream))
        }
        ConnectionTarget::Tcp { host, port, tls } => {
            let mut addrs = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|_| TransportFault::HostUnresolved(host.clone()))?;
            let addr = addrs
                .next()
                .ok_or_else(|| TransportFault::HostUnresolved(host.clone()))?;

            let stream = TcpStream::connect(addr).await.map_err(|e| {
                DockhandError::from(TransportFault::HostUnreachable {
                    host: host.clone(),
                    source: e,
                })
            })?;

            match tls {
                None => Ok(Box::new(stream) as BoxedStream),
                Some(client_tls) => {
                    let server_name = ServerName::try_from(host.clone())
                        .map_err(|_| TransportFault::HostUnresolved(host.clone()))?;
                    let connector = TlsConnector::from(client_tls.config.clone());
                    let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
                        DockhandError::from(TransportFault::ConnectionReset(Box::new(e)))
                    })?;
                    Ok(Box::new(tls_stream) as BoxedStream)
                }
            }
        }
        ConnectionTarget::Tunnel => Err(DockhandError::Internal(
            "tunnel targets are not dialed directly".to_string(),
        )),
    }
}

fn build_request(
    descriptor: &ConnectionDescriptor,
    method: Method,
    path_and_query: &str,
    body: Option<Bytes>,
    extra_headers: Option<&HeaderMap>,
) -> Result<Request<Full<Bytes>>> {
    let host = match &descriptor.target {
        ConnectionTarget::Tcp { host, .. } => host.clone(),
        _ => "localhost".to_string(),
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(path_and_query)
        .header(http::header::HOST, host);

    if body.is_some() {
        builder = builder.header(http::header::CONTENT_TYPE, "application/json");
    }
    if let Some(extra) = extra_headers {
        for (name, value) in extra {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Full::new(body.unwrap_or_default()))
        .map_err(|e| DockhandError::Internal(format!("failed to build request: {e}")))
}

/// Reads a body to the end. Also used on error statuses so the connection is
/// always released with its body consumed.
async fn collect_body(body: Incoming) -> Result<Bytes> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| DockhandError::Transport(map_hyper_error(e)))
}

fn map_hyper_error(e: hyper::Error) -> TransportFault {
    if e.is_incomplete_message() || e.is_canceled() {
        return TransportFault::ConnectionReset(Box::new(e));
    }
    if let Some(io) = find_io_error(&e) {
        match io.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => {
                return TransportFault::ConnectionReset(Box::new(e));
            }
            _ => {}
        }
    }
    TransportFault::Other(Box::new(e))
}

fn find_io_error<'a>(e: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = err.source();
    }
    None
}

/// Maps a non-success response into the error taxonomy: 404 becomes the
/// typed not-found variant, everything else surfaces the runtime's message.
pub(crate) fn ensure_status(
    response: &ApiResponse,
    kind: &'static str,
    name: &str,
) -> Result<()> {
    if response.status.is_success() {
        return Ok(());
    }
    if response.status == StatusCode::NOT_FOUND {
        return Err(DockhandError::NotFound {
            kind,
            name: name.to_string(),
        });
    }
    Err(DockhandError::Api {
        status: response.status.as_u16(),
        message: api_message(&response.body),
    })
}

fn api_message(body: &Bytes) -> String {
    #[derive(serde::Deserialize)]
    struct ApiErrorBody {
        message: String,
    }
    serde_json::from_slice::<ApiErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

/// Minimal query-string encoder for the handful of parameters the API takes.
pub(crate) fn encode_query(pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let mut out = String::from("?");
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&percent_encode(value));
    }
    out
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query() {
        assert_eq!(encode_query(&[]), "");
        assert_eq!(
            encode_query(&[("all", "true".to_string()), ("name", "my app".to_string())]),
            "?all=true&name=my%20app"
        );
        assert_eq!(
            encode_query(&[("filters", "{\"label\":[\"a=b\"]}".to_string())]),
            "?filters=%7B%22label%22%3A%5B%22a%3Db%22%5D%7D"
        );
    }

    #[test]
    fn test_api_message_falls_back_to_raw_body() {
        assert_eq!(
            api_message(&Bytes::from_static(b"{\"message\":\"no such container\"}")),
            "no such container"
        );
        assert_eq!(api_message(&Bytes::from_static(b"plain error\n")), "plain error");
    }

    #[test]
    fn test_ensure_status_maps_404_to_not_found() {
        let response = ApiResponse {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"message\":\"no such container: web\"}"),
        };
        let err = ensure_status(&response, "container", "web").unwrap_err();
        assert!(err.is_not_found());

        let response = ApiResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"message\":\"driver failed\"}"),
        };
        let err = ensure_status(&response, "container", "web").unwrap_err();
        match err {
            DockhandError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "driver failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
