//! Mock inference backend for development and integration testing
//!
//! Accepts the same launch shape the proxy produces:
//! `modelgate-mock-backend -m <artifact> --port <port> [flags]`
//!
//! Flags:
//! - `--startup-delay-ms N`: sleep before binding the port
//! - `--never-ready`: `/health` always answers 503
//! - `--ignore-sigterm`: survive SIGTERM (only SIGKILL stops it)
//! - `--chunks N`: number of SSE events for streaming requests (default 3)
//! - `--chunk-delay-ms N`: delay between SSE events (default 20)
//!
//! Routes:
//! - `GET /health`
//! - `POST /v1/slow`: answers after 10 seconds
//! - `POST /v1/...`: JSON echo, or an SSE stream when the body has `"stream": true`

use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Debug, Clone)]
struct Options {
    artifact: String,
    port: u16,
    startup_delay: Duration,
    never_ready: bool,
    ignore_sigterm: bool,
    chunks: usize,
    chunk_delay: Duration,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Options> {
    let mut opts = Options {
        artifact: String::new(),
        port: 0,
        startup_delay: Duration::ZERO,
        never_ready: false,
        ignore_sigterm: false,
        chunks: 3,
        chunk_delay: Duration::from_millis(20),
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("missing value for {}", arg))
        };
        match arg.as_str() {
            "-m" => opts.artifact = value()?,
            "--port" => opts.port = value()?.parse()?,
            "--startup-delay-ms" => opts.startup_delay = Duration::from_millis(value()?.parse()?),
            "--chunks" => opts.chunks = value()?.parse()?,
            "--chunk-delay-ms" => opts.chunk_delay = Duration::from_millis(value()?.parse()?),
            "--never-ready" => opts.never_ready = true,
            "--ignore-sigterm" => opts.ignore_sigterm = true,
            // llama-server flags the mock does not care about
            _ => {}
        }
    }

    if opts.port == 0 {
        anyhow::bail!("--port is required");
    }
    Ok(opts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Arc::new(parse_args(std::env::args().skip(1))?);

    if opts.ignore_sigterm {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                while sigterm.recv().await.is_some() {
                    eprintln!("mock backend: ignoring SIGTERM");
                }
            });
        }
    }

    if !opts.startup_delay.is_zero() {
        eprintln!("mock backend: sleeping {}ms before starting", opts.startup_delay.as_millis());
        tokio::time::sleep(opts.startup_delay).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", opts.port)).await?;
    println!("mock backend: serving {} on port {}", opts.artifact, opts.port);

    loop {
        let (stream, _) = listener.accept().await?;
        let opts = Arc::clone(&opts);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let opts = Arc::clone(&opts);
                async move { Ok::<_, Infallible>(handle(req, &opts).await) }
            });
            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                eprintln!("mock backend: connection error: {}", e);
            }
        });
    }
}

fn full(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<MockBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(Full::new(body.into()).boxed_unsync())
        .expect("valid response")
}

async fn handle(req: Request<Incoming>, opts: &Options) -> Response<MockBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => {
            if opts.never_ready {
                full(StatusCode::SERVICE_UNAVAILABLE, "application/json", r#"{"status":"loading"}"#)
            } else {
                full(StatusCode::OK, "application/json", r#"{"status":"ok"}"#)
            }
        }
        (&Method::POST, "/v1/slow") => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            full(StatusCode::OK, "application/json", "{}")
        }
        (&Method::POST, p) if p.starts_with("/v1/") => {
            let request_id = req
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return full(StatusCode::BAD_REQUEST, "text/plain", "bad body"),
            };
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let model = json.get("model").cloned().unwrap_or_default();

            if json.get("stream").and_then(|s| s.as_bool()).unwrap_or(false) {
                return sse(opts);
            }

            let reply = serde_json::json!({
                "object": "chat.completion",
                "model": model,
                "path": path,
                "port": opts.port,
                "pid": std::process::id(),
                "request_id": request_id,
            });
            full(StatusCode::OK, "application/json", reply.to_string())
        }
        _ => full(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

/// `data: {"index":i}` events followed by `data: [DONE]`
fn sse(opts: &Options) -> Response<MockBody> {
    let total = opts.chunks;
    let delay = opts.chunk_delay;

    let events = stream::unfold(0usize, move |i| async move {
        if i > total {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        let event = if i == total {
            "data: [DONE]\n\n".to_string()
        } else {
            format!("data: {{\"index\":{}}}\n\n", i)
        };
        Some((Ok::<_, Infallible>(Frame::data(Bytes::from(event))), i + 1))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(StreamBody::new(events).boxed_unsync())
        .expect("valid response")
}
