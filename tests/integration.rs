//! Integration tests for modelgate
//!
//! Backends are instances of the `modelgate-mock-backend` binary, resolved
//! through a throwaway hub cache directory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use modelgate::config::{BackendDefaults, ModelConfig, ServerConfig};
use modelgate::error::{BackendError, ProxyErrorCode};
use modelgate::process::{BackendState, ProcessManager};
use modelgate::proxy::{ProxyServer, RequestRouter};
use modelgate::resolver::HfCacheResolver;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn mock_backend_path() -> &'static str {
    env!("CARGO_BIN_EXE_modelgate-mock-backend")
}

/// Fake hub cache holding one `model.gguf` per repository
fn fake_cache(repos: &[&str]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    for repo in repos {
        let repo_dir = tmp.path().join(format!("models--{}", repo.replace('/', "--")));
        std::fs::create_dir_all(repo_dir.join("refs")).unwrap();
        std::fs::write(repo_dir.join("refs").join("main"), "0123abcd\n").unwrap();
        let snapshot = repo_dir.join("snapshots").join("0123abcd");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(snapshot.join("model.gguf"), b"gguf").unwrap();
    }
    tmp
}

fn test_defaults() -> BackendDefaults {
    BackendDefaults {
        command: mock_backend_path().to_string(),
        startup_timeout_secs: 10,
        health_check_interval_ms: 50,
        shutdown_timeout_secs: 2,
        drain_timeout_secs: 2,
        ..BackendDefaults::default()
    }
}

fn mock_args(pairs: &[(&str, toml::Value)]) -> toml::Table {
    let mut table = toml::Table::new();
    for (flag, value) in pairs {
        table.insert(flag.to_string(), value.clone());
    }
    table
}

struct Harness {
    manager: Arc<ProcessManager>,
    _cache: TempDir,
}

impl Harness {
    fn new(models: Vec<(&str, ModelConfig)>, defaults: BackendDefaults) -> Self {
        let repos: Vec<&str> = models
            .iter()
            .filter_map(|(_, c)| c.repo.as_deref())
            .filter(|r| !r.starts_with("absent/"))
            .collect();
        let cache = fake_cache(&repos);

        let configs: HashMap<String, ModelConfig> =
            models.into_iter().map(|(name, c)| (name.to_string(), c)).collect();
        let manager = ProcessManager::new(configs, defaults, Arc::new(HfCacheResolver::new(cache.path())));

        Self { manager, _cache: cache }
    }

    /// Serve the proxy on an ephemeral port
    async fn serve(&self, server: ServerConfig) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = Arc::new(RequestRouter::new(Arc::clone(&self.manager), &server));
        let proxy = ProxyServer::new(&server, router, shutdown_rx);
        tokio::spawn(async move {
            let _ = proxy.serve(listener).await;
        });

        (addr, shutdown_tx)
    }

    fn running_names(&self) -> Vec<String> {
        self.manager.list_running().into_iter().map(|b| b.name).collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        // Children are spawned with kill_on_drop, but stop explicitly when possible
        let manager = Arc::clone(&self.manager);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { manager.stop_all(false).await });
        }
    }
}

struct Reply {
    status: StatusCode,
    headers: hyper::HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| {
            panic!("invalid JSON ({}): {}", e, String::from_utf8_lossy(&self.body))
        })
    }

    fn proxy_error(&self) -> Option<&str> {
        self.headers.get("x-proxy-error").and_then(|v| v.to_str().ok())
    }
}

async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: impl Into<Bytes>,
) -> Reply {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();

    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path))
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(body.into())).unwrap();

    let response = client.request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

async fn post_json(addr: SocketAddr, path: &str, json: serde_json::Value) -> Reply {
    send(addr, Method::POST, path, &[], json.to_string()).await
}

async fn port_open(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

// ============================================================================
// Process lifecycle
// ============================================================================

#[tokio::test]
async fn test_acquire_starts_and_stop_removes() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());

    let lease = h.manager.acquire("alpha").await.unwrap();
    assert_eq!(lease.name(), "alpha");
    assert!(h.manager.is_ready("alpha"));
    assert_eq!(h.manager.get_in_flight("alpha"), 1);
    assert!(port_open(lease.port()).await);

    let running = h.manager.list_running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].port, lease.port());
    assert_eq!(running[0].pid, lease.backend().pid);
    assert_eq!(running[0].state, BackendState::Ready);

    let port = lease.port();
    drop(lease);
    assert_eq!(h.manager.get_in_flight("alpha"), 0);

    h.manager.stop_backend("alpha").await;
    assert_eq!(h.manager.get_state("alpha"), BackendState::Absent);
    assert!(h.manager.list_running().is_empty());
    assert!(!port_open(port).await);
}

#[tokio::test]
async fn test_acquire_ready_backend_reuses_process() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());

    let first = h.manager.acquire("alpha").await.unwrap();
    let second = h.manager.acquire("alpha").await.unwrap();
    assert_eq!(first.backend().pid, second.backend().pid);
    assert_eq!(h.manager.get_in_flight("alpha"), 2);
}

#[tokio::test]
async fn test_swap_keeps_one_non_persistent_backend() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("beta", ModelConfig::new("org/beta-GGUF")),
            ("embed", ModelConfig::new("org/embed-GGUF").persistent()),
        ],
        test_defaults(),
    );

    h.manager.swap("embed").await.unwrap();
    h.manager.swap("alpha").await.unwrap();
    assert_eq!(h.running_names(), vec!["alpha", "embed"]);

    h.manager.swap("beta").await.unwrap();
    assert_eq!(h.running_names(), vec!["beta", "embed"]);
    assert_eq!(h.manager.get_state("alpha"), BackendState::Absent);

    // Swapping to a ready backend is a no-op
    let beta_pid = h.manager.list_running()[0].pid;
    h.manager.swap("beta").await.unwrap();
    assert_eq!(h.manager.list_running()[0].pid, beta_pid);
}

#[tokio::test]
async fn test_start_does_not_evict() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("beta", ModelConfig::new("org/beta-GGUF")),
        ],
        test_defaults(),
    );

    h.manager.start("alpha").await.unwrap();
    h.manager.start("beta").await.unwrap();
    assert_eq!(h.running_names(), vec!["alpha", "beta"]);

    h.manager.stop_all(false).await;
    assert!(h.manager.list_running().is_empty());
}

#[tokio::test]
async fn test_stop_all_keeps_persistent() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("embed", ModelConfig::new("org/embed-GGUF").persistent()),
        ],
        test_defaults(),
    );

    h.manager.start("alpha").await.unwrap();
    h.manager.start("embed").await.unwrap();

    h.manager.stop_all(true).await;
    assert_eq!(h.running_names(), vec!["embed"]);

    h.manager.stop_all(false).await;
    assert!(h.manager.list_running().is_empty());
}

#[tokio::test]
async fn test_distinct_backends_get_distinct_ports() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("beta", ModelConfig::new("org/beta-GGUF")),
        ],
        test_defaults(),
    );

    h.manager.start("alpha").await.unwrap();
    h.manager.start("beta").await.unwrap();
    let running = h.manager.list_running();
    assert_ne!(running[0].port, running[1].port);
}

#[tokio::test]
async fn test_never_ready_backend_times_out() {
    let defaults = BackendDefaults {
        startup_timeout_secs: 1,
        ..test_defaults()
    };
    let h = Harness::new(
        vec![(
            "stuck",
            ModelConfig::new("org/stuck-GGUF").with_args(mock_args(&[("--never-ready", toml::Value::Boolean(true))])),
        )],
        defaults,
    );

    let started = Instant::now();
    let err = h.manager.acquire("stuck").await.unwrap_err();
    assert!(matches!(err, BackendError::StartupTimeout { secs: 1, .. }), "{:?}", err);
    assert_eq!(err.code(), ProxyErrorCode::BackendStartFailed);
    assert!(started.elapsed() < Duration::from_secs(8));

    assert_eq!(h.manager.get_state("stuck"), BackendState::Absent);
    assert!(h.manager.list_running().is_empty());
}

#[tokio::test]
async fn test_slow_startup_is_awaited() {
    let h = Harness::new(
        vec![(
            "slow",
            ModelConfig::new("org/slow-GGUF")
                .with_args(mock_args(&[("--startup-delay-ms", toml::Value::Integer(400))])),
        )],
        test_defaults(),
    );

    let started = Instant::now();
    let lease = h.manager.acquire("slow").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(port_open(lease.port()).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_ignoring_backend_is_killed() {
    let defaults = BackendDefaults {
        shutdown_timeout_secs: 1,
        ..test_defaults()
    };
    let h = Harness::new(
        vec![(
            "stubborn",
            ModelConfig::new("org/stubborn-GGUF")
                .with_args(mock_args(&[("--ignore-sigterm", toml::Value::Boolean(true))])),
        )],
        defaults,
    );

    let lease = h.manager.acquire("stubborn").await.unwrap();
    let port = lease.port();
    drop(lease);

    let started = Instant::now();
    h.manager.stop_backend("stubborn").await;
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(h.manager.get_state("stubborn"), BackendState::Absent);
    assert!(!port_open(port).await);
}

#[tokio::test]
async fn test_force_stop_is_immediate() {
    let h = Harness::new(
        vec![(
            "stubborn",
            ModelConfig::new("org/stubborn-GGUF")
                .with_args(mock_args(&[("--ignore-sigterm", toml::Value::Boolean(true))])),
        )],
        test_defaults(),
    );

    h.manager.start("stubborn").await.unwrap();
    let started = Instant::now();
    h.manager.stop("stubborn", Duration::from_secs(5), true).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.manager.list_running().is_empty());
}

#[tokio::test]
async fn test_missing_artifact_leaves_nothing_running() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("ghost", ModelConfig::new("absent/ghost-GGUF")),
        ],
        test_defaults(),
    );

    h.manager.swap("alpha").await.unwrap();

    let err = h.manager.acquire("ghost").await.unwrap_err();
    assert!(matches!(err, BackendError::ArtifactNotFound(_)), "{:?}", err);
    assert_eq!(h.manager.get_state("ghost"), BackendState::Absent);
    // Eviction happens before resolution and is not rolled back
    assert!(h.manager.list_running().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquires_for_different_models_stay_serialized() {
    let h = Harness::new(
        vec![
            ("a", ModelConfig::new("org/a-GGUF")),
            ("b", ModelConfig::new("org/b-GGUF")),
            ("c", ModelConfig::new("org/c-GGUF")),
        ],
        test_defaults(),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for name in ["a", "b", "c", "a", "b", "c"] {
        let manager = Arc::clone(&h.manager);
        tasks.spawn(async move {
            let lease = manager.acquire(name).await?;
            assert!(manager.list_running().len() <= 1);
            drop(lease);
            Ok::<_, BackendError>(())
        });
    }

    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
        assert!(h.manager.list_running().len() <= 1);
    }
    assert_eq!(h.manager.list_running().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_backend_with_non_utf8_output_starts() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let wrapper = dir.path().join("noisy-backend.sh");
    std::fs::write(
        &wrapper,
        format!(
            "#!/bin/sh\nprintf '\\377\\376 loading\\n'\nsleep 0.3\nexec '{}' \"$@\"\n",
            mock_backend_path()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();

    let defaults = BackendDefaults {
        command: wrapper.display().to_string(),
        ..test_defaults()
    };
    let h = Harness::new(vec![("noisy", ModelConfig::new("org/noisy-GGUF"))], defaults);

    let lease = h.manager.acquire("noisy").await.unwrap();
    assert!(port_open(lease.port()).await);
    assert_eq!(h.manager.get_state("noisy"), BackendState::Ready);
}

// ============================================================================
// Request routing
// ============================================================================

#[tokio::test]
async fn test_buffered_request_is_proxied() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let reply = post_json(
        addr,
        "/v1/chat/completions",
        serde_json::json!({"model": "alpha", "messages": []}),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let json = reply.json();
    assert_eq!(json["model"], "alpha");
    assert_eq!(json["path"], "/v1/chat/completions");
    assert_eq!(json["port"], h.manager.list_running()[0].port);
    assert_eq!(h.manager.get_in_flight("alpha"), 0);
}

#[tokio::test]
async fn test_request_id_is_propagated_or_generated() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let body = serde_json::json!({"model": "alpha"}).to_string();
    let reply = send(
        addr,
        Method::POST,
        "/v1/completions",
        &[("x-request-id", "req-42")],
        body.clone(),
    )
    .await;
    assert_eq!(reply.json()["request_id"], "req-42");

    let reply = send(addr, Method::POST, "/v1/completions", &[], body).await;
    let generated = reply.json()["request_id"].as_str().unwrap().to_string();
    assert_eq!(generated.len(), 36);
}

#[tokio::test]
async fn test_streaming_response_is_relayed_in_order() {
    let h = Harness::new(
        vec![(
            "alpha",
            ModelConfig::new("org/alpha-GGUF").with_args(mock_args(&[
                ("--chunks", toml::Value::Integer(5)),
                ("--chunk-delay-ms", toml::Value::Integer(10)),
            ])),
        )],
        test_defaults(),
    );
    let server = ServerConfig {
        stream_chunk_size: 8,
        ..ServerConfig::default()
    };
    let (addr, _shutdown) = h.serve(server).await;

    let reply = post_json(
        addr,
        "/v1/chat/completions",
        serde_json::json!({"model": "alpha", "stream": true}),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.headers.get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );

    let expected: String = (0..5)
        .map(|i| format!("data: {{\"index\":{}}}\n\n", i))
        .chain(std::iter::once("data: [DONE]\n\n".to_string()))
        .collect();
    assert_eq!(String::from_utf8_lossy(&reply.body), expected);

    // The lease is released once the stream ends
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.get_in_flight("alpha"), 0);
}

#[tokio::test]
async fn test_requests_swap_between_models() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("beta", ModelConfig::new("org/beta-GGUF")),
            ("embed", ModelConfig::new("org/embed-GGUF").persistent()),
        ],
        test_defaults(),
    );
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    for model in ["embed", "alpha", "beta", "alpha"] {
        let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": model})).await;
        assert_eq!(reply.status, StatusCode::OK, "model {}", model);
        assert_eq!(reply.json()["model"], model);
    }
    assert_eq!(h.running_names(), vec!["alpha", "embed"]);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_launch() {
    let h = Harness::new(
        vec![(
            "alpha",
            ModelConfig::new("org/alpha-GGUF")
                .with_args(mock_args(&[("--startup-delay-ms", toml::Value::Integer(200))])),
        )],
        test_defaults(),
    );
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..4 {
        tasks.spawn(async move {
            post_json(addr, "/v1/completions", serde_json::json!({"model": "alpha"})).await
        });
    }

    let mut pids = Vec::new();
    while let Some(reply) = tasks.join_next().await {
        let reply = reply.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        pids.push(reply.json()["pid"].as_u64().unwrap());
    }
    pids.dedup();
    assert_eq!(pids.len(), 1);
    assert_eq!(h.manager.list_running().len(), 1);
}

// ============================================================================
// Error mapping
// ============================================================================

#[tokio::test]
async fn test_unroutable_requests_are_rejected() {
    let h = Harness::new(
        vec![
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
            ("argless", ModelConfig {
                args: None,
                ..ModelConfig::new("org/alpha-GGUF")
            }),
        ],
        test_defaults(),
    );
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let reply = send(addr, Method::POST, "/v1/completions", &[], "not json").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.proxy_error(), Some("INVALID_REQUEST"));

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"prompt": "hi"})).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let reply = post_json(addr, "/v2/completions", serde_json::json!({"model": "alpha"})).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.proxy_error(), Some("UNSUPPORTED_PATH"));

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": "nope"})).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.proxy_error(), Some("UNKNOWN_MODEL"));
    assert!(reply.json()["message"].as_str().unwrap().contains("nope"));

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": "argless"})).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.proxy_error(), Some("UNKNOWN_MODEL"));

    // Nothing was started for any of these
    assert!(h.manager.list_running().is_empty());
}

#[tokio::test]
async fn test_missing_artifact_returns_404() {
    let h = Harness::new(vec![("ghost", ModelConfig::new("absent/ghost-GGUF"))], test_defaults());
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": "ghost"})).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.proxy_error(), Some("ARTIFACT_NOT_FOUND"));
}

#[tokio::test]
async fn test_startup_failure_returns_503() {
    let defaults = BackendDefaults {
        startup_timeout_secs: 1,
        ..test_defaults()
    };
    let h = Harness::new(
        vec![(
            "stuck",
            ModelConfig::new("org/stuck-GGUF").with_args(mock_args(&[("--never-ready", toml::Value::Boolean(true))])),
        )],
        defaults,
    );
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": "stuck"})).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.proxy_error(), Some("BACKEND_START_FAILED"));
    assert!(reply.json()["message"]
        .as_str()
        .unwrap()
        .starts_with("Model startup failed"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_dead_backend_returns_502() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let lease = h.manager.acquire("alpha").await.unwrap();
    let pid = lease.backend().pid as libc::pid_t;
    let port = lease.port();
    drop(lease);

    // Kill the backend behind the manager's back
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    for _ in 0..50 {
        if !port_open(port).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": "alpha"})).await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.proxy_error(), Some("CONNECTION_FAILED"));
    assert!(reply.json()["message"].as_str().unwrap().starts_with("Proxy error"));
}

#[tokio::test]
async fn test_slow_backend_returns_504() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());
    let server = ServerConfig {
        request_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let (addr, _shutdown) = h.serve(server).await;

    // Warm up so the timeout only covers the request itself
    h.manager.swap("alpha").await.unwrap();

    let started = Instant::now();
    let reply = post_json(addr, "/v1/slow", serde_json::json!({"model": "alpha"})).await;
    assert_eq!(reply.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(reply.proxy_error(), Some("REQUEST_TIMEOUT"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.manager.get_in_flight("alpha"), 0);
}

// ============================================================================
// Administrative endpoints
// ============================================================================

#[tokio::test]
async fn test_admin_endpoints() {
    let h = Harness::new(
        vec![
            ("beta", ModelConfig::new("org/beta-GGUF")),
            ("alpha", ModelConfig::new("org/alpha-GGUF")),
        ],
        test_defaults(),
    );
    let (addr, _shutdown) = h.serve(ServerConfig::default()).await;

    let reply = send(addr, Method::GET, "/v1/models", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::OK);
    let ids: Vec<String> = reply.json()["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["alpha", "beta"]);

    let reply = send(addr, Method::GET, "/models/running", &[], Bytes::new()).await;
    assert_eq!(reply.json(), serde_json::json!([]));

    let reply = post_json(addr, "/v1/completions", serde_json::json!({"model": "alpha"})).await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(addr, Method::GET, "/models/running", &[], Bytes::new()).await;
    let running = reply.json();
    assert_eq!(running.as_array().unwrap().len(), 1);
    assert_eq!(running[0]["model"], "alpha");
    assert_eq!(running[0]["port"], h.manager.list_running()[0].port);

    let reply = send(addr, Method::DELETE, "/models/alpha", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    assert!(h.manager.list_running().is_empty());

    // Unloading something that is not running still succeeds
    let reply = send(addr, Method::DELETE, "/models/alpha", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    let reply = send(addr, Method::DELETE, "/models/unknown", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = send(addr, Method::PUT, "/v1/models", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_server_stops_accepting_after_shutdown() {
    let h = Harness::new(vec![("alpha", ModelConfig::new("org/alpha-GGUF"))], test_defaults());
    let (addr, shutdown) = h.serve(ServerConfig::default()).await;

    let reply = send(addr, Method::GET, "/v1/models", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::OK);

    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
