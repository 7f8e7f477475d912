//! API routes.

pub mod builds;
pub mod health;
pub mod queue;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/repos", builds::repo_router())
        .nest("/builds", builds::router())
        .nest("/queue", queue::router())
}
