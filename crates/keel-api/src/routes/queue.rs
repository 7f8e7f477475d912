//! Queue endpoints.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(queue_info))
        .route("/{route}/length", get(route_length))
}

#[derive(Debug, Serialize)]
struct QueueInfo {
    broker: &'static str,
    cluster: bool,
    routes: Vec<String>,
    /// Builds sent to the default route since startup.
    fallbacks: u64,
}

async fn queue_info(State(state): State<AppState>) -> Json<QueueInfo> {
    let router = state.orchestrator.router();
    Json(QueueInfo {
        broker: router.broker_name(),
        cluster: router.is_cluster(),
        routes: router.routes().to_vec(),
        fallbacks: router.fallback_count(),
    })
}

#[derive(Debug, Serialize)]
struct LengthResponse {
    route: String,
    length: u64,
}

async fn route_length(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> Result<Json<LengthResponse>, ApiError> {
    let length = state.orchestrator.router().length(&route).await?;
    Ok(Json(LengthResponse { route, length }))
}
