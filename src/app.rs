// Application state and router
use axum::Router;
use prometheus::Registry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::{handlers, services::Memstore};

// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub memstore: Arc<Memstore>,
    pub metrics: Registry,
    pub trust_proxy: bool,
}

impl AppState {
    pub fn new(memstore: Arc<Memstore>, metrics: Registry) -> Self {
        Self {
            memstore,
            metrics,
            trust_proxy: false,
        }
    }

    /// Take the client IP from forwarding headers set by a reverse proxy
    pub fn with_trusted_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }
}

/// Build the HTTP router for the collector
pub fn router(state: AppState) -> Router {
    handlers::collector_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
