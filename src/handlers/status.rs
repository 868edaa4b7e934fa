// Health and metrics endpoints

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use prometheus::{Encoder, TextEncoder};

use crate::{app::AppState, utils::service_error::ServiceError};

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "healthy",
        "service": "hitcount-core",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "components": {
            "memstore": {
                "buffered_hits": state.memstore.len(),
                "sessions": state.memstore.session_count(),
            }
        }
    });

    (StatusCode::OK, Json(response))
}

/// GET /metrics - scheduler metrics in Prometheus text format
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&state.metrics.gather(), &mut buffer)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    ))
}
