//! HTTP API over the orchestrator and relay.

pub mod health;
pub mod models;
pub mod proxy;
pub mod servers;
pub mod stream;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(models::router())
        .merge(proxy::router())
        .merge(stream::router())
        .merge(servers::router())
}

/// The complete application with middleware and state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(router())
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
