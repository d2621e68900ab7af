//! Per-model worker routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use fleet_common::PortResponse;

use crate::error::Result;
use crate::orchestrator::WorkerState;
use crate::state::AppState;

/// Build the proxy router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/proxy/:model", get(resolve).delete(stop))
        .route("/proxy/:model/completion", post(completion))
        .route("/proxy/:model/tokenize", post(tokenize))
        .route("/proxy/:model/memory", get(memory))
        .route("/proxy/:model/status", get(status))
}

/// GET /proxy/:model - Port of the model's worker, spawning it if needed.
async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<PortResponse>> {
    let port = state.orchestrator.resolve(&model).await?;
    Ok(Json(PortResponse { port }))
}

/// POST /proxy/:model/completion - Start a generation on the model's worker.
async fn completion(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let port = state.orchestrator.resolve(&model).await?;
    let response = state.worker_client.completion(port, &body).await?;
    Ok(Json(response))
}

/// POST /proxy/:model/tokenize - Tokenize with the model's worker.
async fn tokenize(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let port = state.orchestrator.resolve(&model).await?;
    let response = state.worker_client.tokenize(port, &body).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct MemoryResponse {
    bytes: u64,
}

/// GET /proxy/:model/memory - Resident memory of the model's worker.
async fn memory(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Json<MemoryResponse> {
    let bytes = state.orchestrator.memory_usage(&model).await;
    Json(MemoryResponse { bytes })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: WorkerState,
    streams: usize,
}

/// GET /proxy/:model/status - Lifecycle state without spawning anything.
async fn status(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<StatusResponse>> {
    let worker_state = state.orchestrator.state(&model).await?;
    let streams = state.relay.open_sessions(&model);
    Ok(Json(StatusResponse {
        state: worker_state,
        streams,
    }))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

/// DELETE /proxy/:model - Stop the model's worker.
async fn stop(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<StopResponse>> {
    let stopped = state.orchestrator.stop(&model).await?;
    Ok(Json(StopResponse { stopped }))
}
