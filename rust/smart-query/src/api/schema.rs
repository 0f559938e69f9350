//! Schema inspection and refresh endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Serialize;

use super::status_for;
use crate::AppState;
use crate::error::{PipelineError, ReasonCode};
use crate::schema::{Relationship, TableSchema};

/// Create the schema router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/embed-schema", post(embed_schema))
        .route("/api/schema", get(get_schema))
        .route("/api/schema/{table_name}", get(get_table))
        .route("/api/tables", get(list_tables))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    reason_code: ReasonCode,
    message: String,
}

fn error_response(err: &PipelineError) -> Response {
    let reason = err.reason_code();
    (
        status_for(reason),
        Json(ErrorBody {
            reason_code: reason,
            message: err.public_message(),
        }),
    )
        .into_response()
}

/// Refresh the schema snapshot and rebuild the embedding index.
async fn embed_schema(State(state): State<AppState>) -> Response {
    match state.pipeline.refresh_schema().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Full current snapshot.
async fn get_schema(State(state): State<AppState>) -> Response {
    match state.pipeline.schema() {
        Some(snapshot) => Json(snapshot.as_ref()).into_response(),
        None => error_response(&PipelineError::SchemaUnavailable(
            "no snapshot published".to_string(),
        )),
    }
}

#[derive(Debug, Serialize)]
struct TableDetail<'a> {
    revision: u64,
    #[serde(flatten)]
    table: &'a TableSchema,
    relationships: Vec<&'a Relationship>,
}

/// One table with the relationships that touch it.
async fn get_table(State(state): State<AppState>, Path(table_name): Path<String>) -> Response {
    let Some(snapshot) = state.pipeline.schema() else {
        return error_response(&PipelineError::SchemaUnavailable(
            "no snapshot published".to_string(),
        ));
    };
    let Some(table) = snapshot.table(&table_name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                reason_code: ReasonCode::UnknownIdentifier,
                message: format!("table {table_name} does not exist"),
            }),
        )
            .into_response();
    };
    let relationships = snapshot
        .relationships()
        .iter()
        .filter(|r| r.from_table == table.name || r.to_table == table.name)
        .collect();
    Json(TableDetail {
        revision: snapshot.revision(),
        table,
        relationships,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct TableSummary {
    name: String,
    description: Option<String>,
    row_count: Option<u64>,
    columns: usize,
}

#[derive(Debug, Serialize)]
struct TablesResponse {
    revision: u64,
    tables: Vec<TableSummary>,
}

/// Table names with row and column counts.
async fn list_tables(State(state): State<AppState>) -> Response {
    let Some(snapshot) = state.pipeline.schema() else {
        return error_response(&PipelineError::SchemaUnavailable(
            "no snapshot published".to_string(),
        ));
    };
    let tables = snapshot
        .tables()
        .iter()
        .map(|t| TableSummary {
            name: t.name.clone(),
            description: t.description.clone(),
            row_count: t.row_count,
            columns: t.columns.len(),
        })
        .collect();
    Json(TablesResponse {
        revision: snapshot.revision(),
        tables,
    })
    .into_response()
}
