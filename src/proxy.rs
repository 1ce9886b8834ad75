use crate::app::wait_for_shutdown;
use crate::counter::{ConnectionObserver, TrackedConnection};
use crate::error::{ErrorResponse, ProxyErrorCode};
use crate::gate::HealthGate;
use crate::pool::{backend_uri, ConnectionPool};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID tracking
const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on the backend's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("drain timed out after {timeout:?} with {remaining} connection(s) still open")]
    DrainTimedOut { timeout: Duration, remaining: usize },
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Idle timeout for client connections
    pub idle_timeout: Duration,
    /// Upper bound on waiting for open connections at shutdown
    pub drain_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared by every request on every connection
struct RequestContext {
    gate: Arc<HealthGate>,
    pool: Arc<ConnectionPool>,
    /// Releases requests parked in the readiness gate
    cancel_rx: watch::Receiver<bool>,
}

pub struct ProxyServer {
    listener: TcpListener,
    observer: Arc<dyn ConnectionObserver>,
    ctx: Arc<RequestContext>,
    options: ProxyOptions,
}

impl ProxyServer {
    pub fn new(
        listener: TcpListener,
        observer: Arc<dyn ConnectionObserver>,
        gate: Arc<HealthGate>,
        pool: Arc<ConnectionPool>,
        cancel_rx: watch::Receiver<bool>,
        options: ProxyOptions,
    ) -> Self {
        Self {
            listener,
            observer,
            ctx: Arc::new(RequestContext {
                gate,
                pool,
                cancel_rx,
            }),
            options,
        }
    }

    /// Serve until `drain_rx` flips to true, then drain open connections.
    ///
    /// The listener is closed as soon as draining begins. Connections still
    /// open after the drain timeout are aborted and reported as
    /// [`ProxyError::DrainTimedOut`].
    pub async fn run(self, mut drain_rx: watch::Receiver<bool>) -> Result<(), ProxyError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");
        }

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let tracked = TrackedConnection::open(Arc::clone(&self.observer));
                            let ctx = Arc::clone(&self.ctx);
                            let idle_timeout = self.options.idle_timeout;
                            let conn_drain_rx = drain_rx.clone();

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx, tracked, idle_timeout, conn_drain_rx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = wait_for_shutdown(&mut drain_rx) => {
                    info!("Proxy server shutting down");
                    break;
                }
            }
        }

        drop(self.listener);

        if connections.is_empty() {
            return Ok(());
        }

        let timeout = self.options.drain_timeout;
        info!(open = connections.len(), timeout_ms = timeout.as_millis() as u64, "Draining connections");

        let drained = tokio::time::timeout(timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => {
                debug!("All connections drained");
                Ok(())
            }
            Err(_) => {
                let remaining = connections.len();
                connections.shutdown().await;
                Err(ProxyError::DrainTimedOut { timeout, remaining })
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<RequestContext>,
    tracked: Arc<TrackedConnection>,
    idle_timeout: Duration,
    mut drain_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        let tracked = Arc::clone(&tracked);
        async move {
            tracked.active();
            let response = handle_request(req, &ctx, &tracked, addr).await;
            tracked.idle();
            response
        }
    });

    // A keep-alive connection that sends no new request within the idle
    // timeout is closed by the header read timer
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(idle_timeout)
        .preserve_header_case(true);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(idle_timeout)
        .keep_alive_timeout(idle_timeout)
        .max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
            }
            _ = wait_for_shutdown(&mut drain_rx), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: &RequestContext,
    tracked: &Arc<TrackedConnection>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, not appended; this proxy is the first hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, request_id, "Incoming request");

    let mut cancel_rx = ctx.cancel_rx.clone();
    let target = match ctx.gate.wait_ready(&mut cancel_rx).await {
        Ok(target) => target,
        Err(e) => {
            debug!(request_id, error = %e, "Gave up waiting for backend");
            return Ok(ErrorResponse::new(ProxyErrorCode::BackendUnavailable, "Backend unavailable")
                .with_request_id(request_id)
                .into_response());
        }
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &target, Arc::clone(tracked), request_id).await;
    }

    match ctx.pool.send_request(req, &target).await {
        Ok(response) => Ok(response),
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(backend = %target, request_id, error = %e, "Failed to forward request via pool");
            Ok(ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
                .with_request_id(request_id)
                .into_response())
        }
    }
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// `host:port` of the backend, defaulting to port 80
fn backend_addr(target: &Uri) -> Option<String> {
    let host = target.host()?;
    Some(format!("{}:{}", host, target.port_u16().unwrap_or(80)))
}

/// Build the raw HTTP/1.1 upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, target: &Uri) -> Vec<u8> {
    let path = backend_uri(target, req.uri())
        .ok()
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str().to_string()))
        .unwrap_or_else(|| "/".to_string());

    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if !req.headers().contains_key(hyper::header::HOST) {
        if let Some(authority) = target.authority() {
            request.push_str(&format!("host: {}\r\n", authority));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Position just past the blank line ending an HTTP head
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse the status line and headers of the backend's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read the backend's response head; bytes past it belong to the tunnel
async fn read_upgrade_head(stream: &mut TcpStream) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "upgrade response head too large"));
        }
    }
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, early_data: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(request_id, error = %e, "Failed to relay early tunnel data");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(request_id, client_to_backend, backend_to_client, "Tunnel closed normally");
        }
        Err(e) => {
            debug!(request_id, error = %e, "Tunnel closed with error");
        }
    }
}

fn empty_response(status: StatusCode, headers: &[(String, String)], skip_framing: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;

    for (name, value) in headers {
        let name_lower = name.to_lowercase();
        if skip_framing && (name_lower == "content-length" || name_lower == "transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }

    response
}

fn upgrade_error(code: ProxyErrorCode, message: &str, request_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(code, message)
        .with_request_id(request_id)
        .into_response()
}

/// Tunnel an upgrade request to the backend.
///
/// Once the client side upgrades, the connection leaves HTTP handling and
/// is marked hijacked; it is reported when the tunnel ends.
async fn handle_upgrade(
    req: Request<Incoming>,
    target: &Uri,
    tracked: Arc<TrackedConnection>,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(request_id, upgrade_type, "Handling upgrade request");

    let Some(addr) = backend_addr(target) else {
        return Ok(upgrade_error(ProxyErrorCode::InternalError, "Backend address is invalid", &request_id));
    };

    let raw_request = build_upgrade_request(&req, target);

    let mut backend_stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(addr, error = %e, "Failed to connect to backend for upgrade");
            return Ok(upgrade_error(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend", &request_id));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(addr, error = %e, "Failed to send upgrade request to backend");
        return Ok(upgrade_error(ProxyErrorCode::ConnectionFailed, "Failed to send upgrade request", &request_id));
    }

    let (head, early_data) = match read_upgrade_head(&mut backend_stream).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(addr, error = %e, "Failed to read upgrade response from backend");
            return Ok(upgrade_error(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from backend", &request_id));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(addr, "Failed to parse backend upgrade response");
        return Ok(upgrade_error(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from backend", &request_id));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(addr, status = %status, "Backend rejected upgrade request");
        return Ok(empty_response(status, &response_headers, false));
    }

    info!(request_id, upgrade_type, "Upgrade successful");

    let response = empty_response(StatusCode::SWITCHING_PROTOCOLS, &response_headers, true);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tracked.hijack();
                forward_bidirectional(upgraded, backend_stream, early_data, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
        // Dropping the last handle reports the connection
        drop(tracked);
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/ws?room=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&request(&[("Connection", "Upgrade"), ("Upgrade", "websocket")])));
        assert!(is_upgrade_request(&request(&[("Connection", "keep-alive, upgrade"), ("Upgrade", "websocket")])));
        assert!(!is_upgrade_request(&request(&[("Connection", "keep-alive")])));
        assert!(!is_upgrade_request(&request(&[("Upgrade", "websocket")])));
    }

    #[test]
    fn test_get_upgrade_type() {
        let req = request(&[("Connection", "Upgrade"), ("Upgrade", "WebSocket")]);
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));
    }

    #[test]
    fn test_backend_addr_defaults_port() {
        let uri: Uri = "http://camera.local/stream".parse().unwrap();
        assert_eq!(backend_addr(&uri).as_deref(), Some("camera.local:80"));

        let uri: Uri = "http://127.0.0.1:8080".parse().unwrap();
        assert_eq!(backend_addr(&uri).as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn test_build_upgrade_request_uses_backend_path() {
        let target: Uri = "http://127.0.0.1:8080/base/".parse().unwrap();
        let req = request(&[("Host", "proxy.local"), ("Connection", "Upgrade"), ("Upgrade", "websocket")]);

        let raw = String::from_utf8(build_upgrade_request(&req, &target)).unwrap();
        assert!(raw.starts_with("GET /base/ws?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("host: proxy.local\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_build_upgrade_request_adds_missing_host() {
        let target: Uri = "http://127.0.0.1:8080".parse().unwrap();
        let req = request(&[("Connection", "Upgrade"), ("Upgrade", "websocket")]);

        let raw = String::from_utf8(build_upgrade_request(&req, &target)).unwrap();
        assert!(raw.contains("host: 127.0.0.1:8080\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_find_head_end_splits_early_data() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\n\r\nhello";
        let end = find_head_end(data).unwrap();
        assert_eq!(&data[end..], b"hello");
        assert!(find_head_end(b"HTTP/1.1 101\r\n").is_none());
    }

    #[test]
    fn test_empty_response_skips_framing_headers() {
        let headers = vec![
            ("Upgrade".to_string(), "websocket".to_string()),
            ("Content-Length".to_string(), "0".to_string()),
        ];
        let response = empty_response(StatusCode::SWITCHING_PROTOCOLS, &headers, true);
        assert!(response.headers().contains_key("upgrade"));
        assert!(!response.headers().contains_key("content-length"));
    }

    #[tokio::test]
    async fn test_upgrade_error_carries_request_id() {
        let response = upgrade_error(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend", "req-7");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("x-proxy-error").unwrap(), "CONNECTION_FAILED");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["request_id"], "req-7");
    }
}
