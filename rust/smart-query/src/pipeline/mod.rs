//! Request orchestration.
//!
//! A request moves `Received → Retrieving → Synthesizing → Validating →
//! Executing → Completed`. Any stage may end it with a failure that records
//! the stage and a [`ReasonCode`]. The only way back is a single
//! re-synthesis after a recoverable rejection or provider error.

pub mod cache;
mod orchestrator;

pub use cache::{CacheStats, CachedSql, QueryCache};
pub use orchestrator::QueryOrchestrator;

use serde::Serialize;
use uuid::Uuid;

use crate::database::QueryRows;
use crate::error::{PipelineError, ReasonCode, Stage, StageError};

/// Caller-facing failure description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryFailure {
    pub stage: Stage,
    pub reason_code: ReasonCode,
    pub message: String,
    /// Offending identifiers for validation rejections.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
}

impl From<&StageError> for QueryFailure {
    fn from(err: &StageError) -> Self {
        let identifiers = match &err.source {
            PipelineError::Rejected { identifiers, .. } => identifiers.clone(),
            _ => Vec::new(),
        };
        Self {
            stage: err.stage,
            reason_code: err.reason_code(),
            message: err.source.public_message(),
            identifiers,
        }
    }
}

/// Outcome of one pipeline request.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub request_id: Uuid,
    pub success: bool,
    /// Last stage reached; `completed` on success.
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryFailure>,
    /// Tables offered to the model.
    pub relevant_tables: Vec<String>,
    /// Schema revision the request was answered against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    pub cached: bool,
    pub fallback_context: bool,
    /// Synthesis attempts made.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl QueryResult {
    fn new(request_id: Uuid, question: Option<String>) -> Self {
        Self {
            request_id,
            success: false,
            stage: Stage::Received,
            question,
            sql: None,
            columns: None,
            rows: None,
            row_count: None,
            error: None,
            relevant_tables: Vec::new(),
            revision: None,
            cached: false,
            fallback_context: false,
            attempts: 0,
            duration_ms: 0,
        }
    }

    fn fail(&mut self, err: &StageError) {
        self.success = false;
        self.stage = err.stage;
        self.error = Some(QueryFailure::from(err));
    }

    fn complete(&mut self, rows: Option<QueryRows>) {
        self.success = true;
        self.stage = Stage::Completed;
        if let Some(rows) = rows {
            self.row_count = Some(rows.len());
            self.columns = Some(rows.columns);
            self.rows = Some(rows.rows);
        }
    }

    pub fn reason_code(&self) -> Option<ReasonCode> {
        self.error.as_ref().map(|e| e.reason_code)
    }
}

/// Result of an explicit schema refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub revision: u64,
    pub tables: usize,
    pub entities: usize,
    pub relationships: usize,
    /// Index revision now published.
    pub index_revision: u64,
}

/// Readiness information for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub schema_revision: Option<u64>,
    pub index_revision: Option<u64>,
    pub tables: usize,
    pub database: &'static str,
    pub embedder: &'static str,
    pub cache: CacheStats,
}

impl PipelineStatus {
    /// A snapshot and a matching index are published.
    pub fn is_ready(&self) -> bool {
        self.schema_revision.is_some() && self.index_revision == self.schema_revision
    }
}
