//! HTTP intake surface.

pub mod api;
pub mod health;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::engine::DeleteScheduler;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: DeleteScheduler,
}

impl AppState {
    pub fn new(scheduler: DeleteScheduler) -> Self {
        Self { scheduler }
    }
}

/// Build the application router.
///
/// `/metrics` is only mounted when Prometheus export is enabled.
pub fn build_router(state: AppState, metrics_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .nest("/v1", api_routes());

    if metrics_enabled {
        app = app.route("/metrics", get(health::metrics));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/schedule", post(api::schedule))
        .route("/metrics", get(api::metrics_snapshot))
}
