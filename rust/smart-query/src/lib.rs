//! Smart Query - natural-language questions to validated SQL.
//!
//! A question is matched against an embedding index of the database schema,
//! the relevant tables are handed to a language model, and the SQL it writes
//! is statically checked before it runs read-only against ClickHouse.
//!
//! # Architecture
//!
//! - [`schema`]: versioned schema snapshots and the store that refreshes them
//! - [`embedding`]: embedding providers and the generation-swapped index
//! - [`retrieval`]: schema context for a question
//! - [`sql`]: SQL synthesis and the safety validator
//! - [`pipeline`]: the request state machine, caching and deadlines
//! - [`database`]: the database client seam and its ClickHouse implementation
//! - [`llm`]: completion providers
//! - [`api`]: HTTP endpoints
//!
//! # Example
//!
//! ```rust,ignore
//! use smart_query::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let app = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions, reason = "types are re-exported by name")]

pub mod api;
pub mod config;
pub mod database;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod retrieval;
pub mod schema;
pub mod server;
pub mod sql;

use std::sync::Arc;

use config::AppConfig;
use pipeline::QueryOrchestrator;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<QueryOrchestrator>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<QueryOrchestrator>) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
