use std::sync::Arc;

use axum::{routing::get, Router};
use blogmesh_metrics::SyncMetrics;
use tower_http::trace::TraceLayer;

use crate::handler;

/// Metrics endpoint: `GET /metrics`, 404 for every other path.
pub fn build_router(metrics: Arc<SyncMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(handler::metrics_handler))
        .fallback(handler::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}
