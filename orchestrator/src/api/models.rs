//! Model and instance listings.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use fleet_common::{format_size, ModelEntry};

use crate::error::Result;
use crate::registry::InstanceHeartbeat;
use crate::state::AppState;

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/instances", get(list_instances))
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    data: Vec<ModelData>,
}

#[derive(Debug, Serialize)]
struct ModelData {
    #[serde(flatten)]
    entry: ModelEntry,
    size: String,
}

impl From<ModelEntry> for ModelData {
    fn from(entry: ModelEntry) -> Self {
        Self {
            size: format_size(entry.size_bytes),
            entry,
        }
    }
}

/// GET /models - Model files with the port of their running worker.
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelsResponse>> {
    let models = state.orchestrator.list_known_models().await?;
    Ok(Json(ModelsResponse {
        data: models.into_iter().map(ModelData::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct InstancesResponse {
    instance_id: String,
    data: Vec<InstanceHeartbeat>,
}

/// GET /instances - Heartbeats of every orchestrator sharing the registry.
async fn list_instances(State(state): State<Arc<AppState>>) -> Result<Json<InstancesResponse>> {
    let data = state.orchestrator.instances().await?;
    Ok(Json(InstancesResponse {
        instance_id: state.orchestrator.instance_id().to_string(),
        data,
    }))
}
