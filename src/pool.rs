//! Connection pool for backend HTTP connections
//!
//! Requests arriving at the proxy are fully read before routing (the `model`
//! field lives in the body), so the outbound client carries `Full<Bytes>`
//! bodies. Responses are returned unbuffered so the router can decide between
//! relaying a stream and collecting a single body.

use http_body_util::{Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client (connection refused, reset, ...)
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
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

/// Remove hop-by-hop headers, plus any header named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, Full<Bytes>>,
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
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client }
    }

    /// Forward a request (head plus already-read body) to a local backend port
    pub async fn send_request(
        &self,
        parts: &Parts,
        body: Bytes,
        port: u16,
    ) -> Result<Response<Incoming>, PoolError> {
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        // Recomputed from the buffered body
        headers.remove(header::CONTENT_LENGTH);

        let mut backend_req = Request::builder()
            .method(parts.method.clone())
            .uri(&uri)
            .body(Full::new(body))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *backend_req.headers_mut() = headers;

        Ok(self.client.request(backend_req).await?)
    }
}

/// Client used to poll backend health endpoints during startup
#[derive(Clone)]
pub struct HealthClient {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for HealthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(Duration::from_secs(1)));
        Self {
            client: Client::builder(TokioExecutor::new())
                .pool_max_idle_per_host(0)
                .build(connector),
        }
    }

    /// Returns true if `GET http://127.0.0.1:<port><path>` answers 2xx within `timeout`
    pub async fn check(&self, port: u16, path: &str, timeout: Duration) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", port, path);
        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(port, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(port, "Health probe timed out");
                false
            }
        }
    }
}
