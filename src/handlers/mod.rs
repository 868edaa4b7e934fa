// HTTP handlers for the hit collector
// Ingestion plus health and metrics endpoints

pub mod count;
pub mod status;

use crate::app::AppState;
use axum::{routing::get, Router};

// Collector routes
pub fn collector_routes() -> Router<AppState> {
    Router::new()
        .route("/count", get(count::count).post(count::count))
        .route("/health", get(status::health_check))
        .route("/metrics", get(status::metrics))
}
