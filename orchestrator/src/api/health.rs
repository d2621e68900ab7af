//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health - Health check endpoint.
///
/// Reports 503 once the instance has started shutting down.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let orchestrator = &state.orchestrator;
    if orchestrator.is_terminal() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "shutting_down",
                "instance_id": orchestrator.instance_id(),
            })),
        );
    }

    let workers = orchestrator.local_ports().await.len();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "instance_id": orchestrator.instance_id(),
            "workers": workers,
        })),
    )
}
