//! Stopping workers by port.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::delete;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::state::AppState;

/// Build the servers router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/servers/:port", delete(stop_server))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

/// DELETE /servers/:port - Stop the worker on a port, or every worker of
/// this instance with `all`.
async fn stop_server(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
) -> Result<Json<StopResponse>> {
    if port == "all" {
        let stopped = state.orchestrator.stop_all().await;
        return Ok(Json(StopResponse { stopped }));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("not a port: {}", port)))?;
    let stopped = state.orchestrator.stop_by_port(port).await?;
    Ok(Json(StopResponse { stopped }))
}
