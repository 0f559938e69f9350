//! Health check endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::AppState;
use crate::pipeline::PipelineStatus;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Liveness; never touches the database.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    #[serde(flatten)]
    pipeline: PipelineStatus,
}

/// Ready once a schema snapshot and a matching index are published.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let pipeline = state.pipeline.status().await;
    let (code, status) = if pipeline.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (code, Json(ReadinessResponse { status, pipeline }))
}
