use crate::admin;
use crate::config::ServerConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{strip_hop_by_hop, ConnectionPool, PoolConfig};
use crate::process::ProcessManager;
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::VecDeque;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Response body type used by every handler
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Requests under this prefix are routed by the `model` field of their body
const INFERENCE_PREFIX: &str = "/v1";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Why a request could not be mapped to a backend name
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Request body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Request body has no string `model` field")]
    MissingModel,
    #[error("`{0}` is not supported yet")]
    UnsupportedPath(String),
}

impl RouteError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RouteError::InvalidJson(_) | RouteError::MissingModel => ProxyErrorCode::InvalidRequest,
            RouteError::UnsupportedPath(_) => ProxyErrorCode::UnsupportedPath,
        }
    }
}

fn is_inference_path(path: &str) -> bool {
    path == INFERENCE_PREFIX
        || path
            .strip_prefix(INFERENCE_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Determine the backend name for a request
pub fn resolve_target(path: &str, body: &[u8]) -> Result<String, RouteError> {
    if !is_inference_path(path) {
        return Err(RouteError::UnsupportedPath(path.to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| RouteError::InvalidJson(e.to_string()))?;

    value
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .ok_or(RouteError::MissingModel)
}

/// A response is streamed when it is an event stream or chunked
pub fn is_streaming(headers: &HeaderMap) -> bool {
    let header_contains = |name: HeaderName, needle: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains(needle))
    };

    header_contains(CONTENT_TYPE, "text/event-stream") || header_contains(TRANSFER_ENCODING, "chunked")
}

/// State carried by the streaming relay
struct Relay<B, G> {
    upstream: B,
    pending: VecDeque<Bytes>,
    chunk_size: usize,
    done: bool,
    /// Held until the client body is finished or dropped
    _guard: G,
}

/// Relay an upstream body chunk by chunk.
///
/// Data frames are forwarded in arrival order, split so no chunk exceeds
/// `chunk_size`. An upstream error ends the stream cleanly instead of
/// failing the client connection. If the client goes away, hyper drops the
/// body, which drops the upstream and `guard` with it.
pub fn relay_stream<B, G>(upstream: B, chunk_size: usize, guard: G) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Display + Send,
    G: Send + 'static,
{
    let state = Relay {
        upstream,
        pending: VecDeque::new(),
        chunk_size: chunk_size.max(1),
        done: false,
        _guard: guard,
    };

    let frames = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok::<_, hyper::Error>(Frame::data(chunk)), st));
            }
            if st.done {
                return None;
            }
            match st.upstream.frame().await {
                Some(Ok(frame)) => {
                    // Trailers are not relayed
                    if let Ok(mut data) = frame.into_data() {
                        while data.len() > st.chunk_size {
                            st.pending.push_back(data.split_to(st.chunk_size));
                        }
                        if !data.is_empty() {
                            st.pending.push_back(data);
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Streaming error, truncating response");
                    st.done = true;
                }
                None => st.done = true,
            }
        }
    });

    StreamBody::new(frames).boxed_unsync()
}

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Routes inbound requests to backends and relays their responses
pub struct RequestRouter {
    process_manager: Arc<ProcessManager>,
    pool: ConnectionPool,
    request_timeout: Duration,
    chunk_size: usize,
}

impl RequestRouter {
    pub fn new(process_manager: Arc<ProcessManager>, server: &ServerConfig) -> Self {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        });
        Self {
            process_manager,
            pool,
            request_timeout: server.request_timeout(),
            chunk_size: server.stream_chunk_size,
        }
    }

    /// Dispatch a request to the administrative endpoints or the proxy
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::DELETE {
            if let Some(name) = admin::unload_target(&path) {
                return admin::unload(&self.process_manager, &name).await;
            }
        }

        match (&method, path.as_str()) {
            (&Method::GET, "/v1/models") => admin::list_models(&self.process_manager),
            (&Method::GET, "/models/running") => admin::list_running(&self.process_manager),
            (&Method::POST, _) => self.proxy(req, client_addr).await,
            _ => json_error_response(
                ProxyErrorCode::MethodNotAllowed,
                format!("Method {} not allowed for {}", method, path),
            ),
        }
    }

    async fn proxy<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: Display,
    {
        let (mut parts, body) = req.into_parts();

        // Generate or propagate request ID
        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            parts.headers.insert(X_REQUEST_ID, value);
        }

        let path_qs = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(request_id, error = %e, "Failed to read request body");
                return json_error_response(
                    ProxyErrorCode::InvalidRequest,
                    format!("Failed to read request body: {}", e),
                );
            }
        };

        let name = match resolve_target(parts.uri.path(), &body) {
            Ok(name) => name,
            Err(e) => {
                debug!(request_id, path = %path_qs, error = %e, "Unroutable request");
                return json_error_response(e.code(), e.to_string());
            }
        };

        debug!(model = %name, method = %parts.method, path = %path_qs, request_id, "Incoming request");

        let lease = match self.process_manager.acquire(&name).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(model = %name, request_id, error = %e, "Failed to acquire backend");
                let code = e.code();
                let message = match code {
                    ProxyErrorCode::BackendStartFailed => format!("Model startup failed: {}", e),
                    _ => e.to_string(),
                };
                return json_error_response(code, message);
            }
        };
        let port = lease.port();

        let deadline = tokio::time::Instant::now() + self.request_timeout;
        let response = match tokio::time::timeout_at(deadline, self.pool.send_request(&parts, body, port)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(model = %name, port, request_id, error = %e, "Failed to forward request");
                return json_error_response(ProxyErrorCode::ConnectionFailed, format!("Proxy error: {}", e));
            }
            Err(_) => {
                warn!(
                    model = %name,
                    port,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                return json_error_response(ProxyErrorCode::RequestTimeout, "Request timeout");
            }
        };

        info!(
            remote = %client_addr,
            method = %parts.method,
            path = %path_qs,
            status = response.status().as_u16(),
            request_id,
            "Proxied request"
        );

        let (mut head, upstream) = response.into_parts();
        let streaming = is_streaming(&head.headers);
        strip_hop_by_hop(&mut head.headers);
        head.headers.remove(CONTENT_LENGTH);

        if streaming {
            return Response::from_parts(head, relay_stream(upstream, self.chunk_size, lease));
        }

        match tokio::time::timeout_at(deadline, upstream.collect()).await {
            Ok(Ok(collected)) => Response::from_parts(head, full_body(collected.to_bytes())),
            Ok(Err(e)) => {
                error!(model = %name, port, request_id, error = %e, "Failed to read backend response");
                json_error_response(ProxyErrorCode::ConnectionFailed, format!("Proxy error: {}", e))
            }
            Err(_) => {
                warn!(model = %name, port, request_id, "Timed out reading backend response");
                json_error_response(ProxyErrorCode::RequestTimeout, "Request timeout")
            }
        }
    }
}

/// The proxy's HTTP server
pub struct ProxyServer {
    bind: String,
    port: u16,
    router: Arc<RequestRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(server: &ServerConfig, router: Arc<RequestRouter>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind: server.bind.clone(),
            port: server.port,
            router,
            shutdown_rx,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.bind.as_str(), self.port))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}:{}: {}", self.bind, self.port, e))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, router: Arc<RequestRouter>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(router.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
