//! Database client abstraction.
//!
//! The pipeline only needs two things from the database: a structural
//! description of its tables and read-only query execution. Both go through
//! [`DatabaseClient`] so tests can substitute an in-memory implementation.

pub mod clickhouse;

pub use clickhouse::ClickHouseClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::TableSchema;

/// Errors returned by a database client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// The database could not be reached or refused the request.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// The database accepted the request but the query failed.
    #[error("Query failed: {0}")]
    Execution(String),

    /// The response could not be decoded.
    #[error("Unexpected database response: {0}")]
    Decode(String),
}

/// Tabular query output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read-only access to the analytical database.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Describe every table of the configured database.
    async fn describe_schema(&self) -> Result<Vec<TableSchema>, DatabaseError>;

    /// Execute an already validated statement.
    async fn execute(&self, sql: &str) -> Result<QueryRows, DatabaseError>;

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}
