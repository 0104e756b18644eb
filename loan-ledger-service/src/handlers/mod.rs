//! HTTP handlers for loan-ledger-service.

pub mod callbacks;
pub mod loans;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services::get_metrics;
use crate::AppState;

/// Liveness probe.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "loan-ledger-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness probe: the service is useless without its database.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.db().health_check().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
