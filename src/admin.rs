//! Administrative endpoints: model listing, running backends, unload

use crate::process::ProcessManager;
use crate::proxy::ProxyBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::info;

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const UNLOAD_PREFIX: &str = "/models/";

#[derive(Debug, Serialize)]
struct ModelEntry<'a> {
    id: &'a str,
    object: &'static str,
    owned_by: &'a str,
}

#[derive(Debug, Serialize)]
struct ModelList<'a> {
    object: &'static str,
    data: Vec<ModelEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct RunningEntry {
    model: String,
    port: u16,
    pid: u32,
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ProxyBody> {
    let body = serde_json::to_vec(body).unwrap_or_else(|_| b"null".to_vec());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed_unsync())
        .expect("valid response with StatusCode enum and static header")
}

/// `GET /v1/models`: every configured backend
pub fn list_models(process_manager: &ProcessManager) -> Response<ProxyBody> {
    let names = process_manager.model_names();
    let owned_by = process_manager.defaults().owned_by.as_str();
    let list = ModelList {
        object: "list",
        data: names
            .iter()
            .map(|name| ModelEntry {
                id: name,
                object: "model",
                owned_by,
            })
            .collect(),
    };
    json_response(StatusCode::OK, &list)
}

/// `GET /models/running`: backends currently in the active set
pub fn list_running(process_manager: &ProcessManager) -> Response<ProxyBody> {
    let running: Vec<RunningEntry> = process_manager
        .list_running()
        .into_iter()
        .map(|b| RunningEntry {
            model: b.name,
            port: b.port,
            pid: b.pid,
        })
        .collect();
    json_response(StatusCode::OK, &running)
}

/// Model name from a `DELETE /models/{name}` path
pub fn unload_target(path: &str) -> Option<String> {
    let raw = path.strip_prefix(UNLOAD_PREFIX)?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    let name = urlencoding::decode(raw).ok()?.into_owned();
    Some(name)
}

/// `DELETE /models/{name}`: always 204, whether or not it was running
pub async fn unload(process_manager: &ProcessManager, name: &str) -> Response<ProxyBody> {
    info!(model = name, "Unload requested");
    process_manager.stop_backend(name).await;
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync())
        .expect("valid response with StatusCode enum")
}
