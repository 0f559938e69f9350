//! Question and SQL endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use serde::Deserialize;

use super::status_for;
use crate::AppState;
use crate::pipeline::QueryResult;

/// Create the query router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/smart-query", post(smart_query))
        .route("/api/generate-sql", post(generate_sql))
        .route("/api/query", post(execute_query))
}

/// Natural-language request body.
#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub query: String,
}

/// Raw SQL request body.
#[derive(Debug, Deserialize)]
pub struct SqlRequest {
    pub sql: String,
}

fn respond(result: QueryResult) -> (StatusCode, Json<QueryResult>) {
    let code = result.reason_code().map_or(StatusCode::OK, status_for);
    (code, Json(result))
}

/// Answer a question and return the rows.
async fn smart_query(
    State(state): State<AppState>,
    Json(req): Json<QuestionRequest>,
) -> (StatusCode, Json<QueryResult>) {
    respond(state.pipeline.process(&req.query).await)
}

/// Return validated SQL without executing it.
async fn generate_sql(
    State(state): State<AppState>,
    Json(req): Json<QuestionRequest>,
) -> (StatusCode, Json<QueryResult>) {
    respond(state.pipeline.generate(&req.query).await)
}

/// Validate and execute caller-provided SQL.
async fn execute_query(
    State(state): State<AppState>,
    Json(req): Json<SqlRequest>,
) -> (StatusCode, Json<QueryResult>) {
    respond(state.pipeline.execute_sql(&req.sql).await)
}
