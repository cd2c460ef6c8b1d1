//! Error types and JSON error responses for the proxy

use crate::proxy::ProxyBody;
use crate::resolver::ResolveError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors from the backend lifecycle manager
#[derive(Debug, Error)]
pub enum BackendError {
    /// Name not configured, or configured without `repo`/`args`
    #[error("Model `{0}` is not configured properly")]
    UnknownBackend(String),
    /// The artifact could not be found in the local cache
    #[error("{0}")]
    ArtifactNotFound(String),
    /// The repository holds several artifacts and none was chosen
    #[error("{0}")]
    AmbiguousArtifact(String),
    /// The health endpoint never answered within the startup budget
    #[error("Backend `{name}` on port {port} failed to start within {secs}s")]
    StartupTimeout { name: String, port: u16, secs: u64 },
    /// Spawn failure, early exit, or port allocation failure
    #[error("Backend `{name}` failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

impl BackendError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            BackendError::UnknownBackend(_) => ProxyErrorCode::UnknownModel,
            BackendError::ArtifactNotFound(_) => ProxyErrorCode::ArtifactNotFound,
            BackendError::AmbiguousArtifact(_) => ProxyErrorCode::InvalidRequest,
            BackendError::StartupTimeout { .. } | BackendError::StartupFailed { .. } => {
                ProxyErrorCode::BackendStartFailed
            }
        }
    }
}

impl From<ResolveError> for BackendError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(_) => BackendError::ArtifactNotFound(err.to_string()),
            ResolveError::Ambiguous(_) => BackendError::AmbiguousArtifact(err.to_string()),
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Body is not valid JSON or lacks a usable `model` field
    InvalidRequest,
    /// Path is outside the routed API namespace
    UnsupportedPath,
    /// `model` names a backend that is not configured
    UnknownModel,
    /// Backend artifact missing from the local cache
    ArtifactNotFound,
    /// Backend failed to start
    BackendStartFailed,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Backend did not answer in time
    RequestTimeout,
    /// Route exists but not for this method
    MethodNotAllowed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnsupportedPath => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownModel => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ArtifactNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::UnsupportedPath => "UNSUPPORTED_PATH",
            ProxyErrorCode::UnknownModel => "UNKNOWN_MODEL",
            ProxyErrorCode::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed_unsync())
        .expect("valid response with StatusCode enum and static headers")
}
