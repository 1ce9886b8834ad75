//! Connection pool for backend HTTP connections
//!
//! This module provides connection pooling for efficient reuse of HTTP connections
//! to the backend, reducing latency and resource usage. Readiness probes go
//! through a dedicated client so they never queue behind proxied traffic.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections to the backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to the backend
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for readiness probes (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes must observe a fresh connection attempt each time, so the
        // health client keeps nothing idle
        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
        }
    }

    /// Forward a request to `target`, keeping the request's path and query
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        target: &Uri,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = backend_uri(target, req.uri())?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(uri);

        // Copy headers
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Send a HEAD request and return the status of whatever answered
    pub async fn head(&self, target: &Uri) -> Result<StatusCode, PoolError> {
        let req = Request::builder()
            .method(Method::HEAD)
            .uri(target.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.health_client.request(req).await?;
        Ok(response.status())
    }
}

/// Combine the backend target with an incoming request URI.
///
/// Scheme and authority come from the target. Paths are joined with exactly
/// one slash between them, and the target's query is prepended to the
/// request's.
pub fn backend_uri(target: &Uri, request: &Uri) -> Result<Uri, PoolError> {
    let base = target.path();
    let path = request.path();
    let joined = match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    };

    let path_and_query = match (target.query(), request.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => format!("{}?{}&{}", joined, a, b),
        (Some(q), _) | (_, Some(q)) if !q.is_empty() => format!("{}?{}", joined, q),
        _ => joined,
    };

    let scheme = target.scheme_str().unwrap_or("http");
    let authority = target
        .authority()
        .ok_or_else(|| PoolError::RequestBuild(format!("backend URL has no host: {}", target)))?;

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}
