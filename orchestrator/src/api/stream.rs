//! Token streams as Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::state::AppState;

/// Build the stream router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/proxy/:model/stream", get(open_stream).delete(close_stream))
}

/// GET /proxy/:model/stream - Subscribe to the model's token stream.
///
/// Each event's data is a JSON `StreamEvent`; the response ends after the
/// event with `done` set. Disconnecting cancels the generation.
async fn open_stream(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.relay.open_stream(&model).map(|event| {
        let sse = Event::default().json_data(&event).unwrap_or_else(|e| {
            tracing::warn!("Failed to encode stream event: {}", e);
            Event::default().event("error").data(e.to_string())
        });
        Ok(sse)
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
struct CloseResponse {
    closed: usize,
}

/// DELETE /proxy/:model/stream - Cancel every open stream on the model.
async fn close_stream(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Json<CloseResponse> {
    let closed = state.relay.close_stream(&model);
    Json(CloseResponse { closed })
}
