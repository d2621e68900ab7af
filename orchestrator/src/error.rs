//! Error types for the orchestrator.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error types for orchestration and relay operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid model key: {0:?}")]
    InvalidModelKey(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No free port in range {base}-{max}")]
    PortExhausted { base: u16, max: u16 },

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker for {model_key} is owned by instance {owner_id}")]
    OwnershipConflict { model_key: String, owner_id: String },

    #[error("Worker unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Nothing accepts connections on the worker's port yet.
    #[error("Worker not ready: {0}")]
    WorkerNotReady(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Registry(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::WorkerNotReady(e.to_string())
        } else {
            Error::UpstreamUnavailable(e.to_string())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::InvalidModelKey(_) => (StatusCode::BAD_REQUEST, "invalid_model_key"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::PortExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "port_exhausted"),
            Error::SpawnFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed"),
            Error::OwnershipConflict { .. } => (StatusCode::CONFLICT, "ownership_conflict"),
            Error::UpstreamUnavailable(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
            Error::WorkerNotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, "worker_not_ready"),
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            Error::Registry(_) => (StatusCode::INTERNAL_SERVER_ERROR, "registry_error"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
