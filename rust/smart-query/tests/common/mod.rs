//! Shared fixtures and test doubles for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use smart_query::config::AppConfig;
use smart_query::database::{DatabaseClient, DatabaseError, QueryRows};
use smart_query::embedding::HashingEmbedder;
use smart_query::error::ProviderError;
use smart_query::llm::{LlmProvider, LlmSettings, Prompt, Provider};
use smart_query::pipeline::QueryOrchestrator;
use smart_query::schema::{ColumnSchema, SchemaSnapshot, TableSchema};

/// customers, orders and products, in that order.
pub fn fixture_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new(
            "customers",
            vec![
                ColumnSchema::new("id", "UInt64"),
                ColumnSchema::new("name", "String").with_samples(["Acme", "Globex", "Initech"]),
                ColumnSchema::new("revenue", "Float64"),
                ColumnSchema::new("country", "LowCardinality(String)"),
            ],
        )
        .with_row_count(1200),
        TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "UInt64"),
                ColumnSchema::new("customer_id", "UInt64"),
                ColumnSchema::new("total_amount", "Float64"),
                ColumnSchema::new("status", "String").with_samples(["paid", "refunded"]),
                ColumnSchema::new("created_at", "DateTime"),
            ],
        )
        .with_row_count(50_000),
        TableSchema::new(
            "products",
            vec![
                ColumnSchema::new("id", "UInt64"),
                ColumnSchema::new("title", "String"),
                ColumnSchema::new("price", "Float64"),
            ],
        ),
    ]
}

pub fn fixture_snapshot() -> SchemaSnapshot {
    SchemaSnapshot::new(1, fixture_tables()).unwrap()
}

/// In-memory database that counts schema descriptions and records executed SQL.
pub struct MockDatabase {
    tables: Vec<TableSchema>,
    pub describe_calls: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
    pub describe_delay: Duration,
    pub fail_describe: AtomicBool,
    pub fail_execute: AtomicBool,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self {
            tables: fixture_tables(),
            describe_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            describe_delay: Duration::ZERO,
            fail_describe: AtomicBool::new(false),
            fail_execute: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.describe_delay = delay;
        self
    }

    pub fn describe_count(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabase {
    async fn describe_schema(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.describe_delay.is_zero() {
            tokio::time::sleep(self.describe_delay).await;
        }
        if self.fail_describe.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("connection refused".to_string()));
        }
        Ok(self.tables.clone())
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows, DatabaseError> {
        self.executed.lock().push(sql.to_string());
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(DatabaseError::Execution(
                "Code: 60. DB::Exception: Table default.customers doesn't exist".to_string(),
            ));
        }
        Ok(QueryRows {
            columns: vec!["name".to_string(), "revenue".to_string()],
            rows: vec![
                vec![serde_json::json!("Acme"), serde_json::json!(9100.5)],
                vec![serde_json::json!("Globex"), serde_json::json!(7200.0)],
            ],
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Language model that replays scripted responses and records prompts.
///
/// When the script runs out, the last response repeats.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    last: Mutex<Option<Result<String, ProviderError>>>,
    pub prompts: Mutex<Vec<Prompt>>,
    settings: LlmSettings,
    delay: Duration,
}

impl ScriptedLlm {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            settings: LlmSettings::default(),
            delay: Duration::ZERO,
        }
    }

    /// Always answer with `sql` wrapped in the JSON response format.
    pub fn answering(sql: &str) -> Self {
        Self::new(vec![Ok(json_sql(sql))])
    }

    /// Every call fails the way a provider-side timeout does.
    pub fn timing_out() -> Self {
        Self::new(vec![Err(ProviderError::Timeout(Duration::from_secs(30)))])
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompt(&self, index: usize) -> Prompt {
        self.prompts.lock()[index].clone()
    }
}

pub fn json_sql(sql: &str) -> String {
    serde_json::json!({ "sql": sql, "parameters": {} }).to_string()
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        self.prompts.lock().push(prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        match next {
            Some(response) => {
                *self.last.lock() = Some(response.clone());
                response
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or_else(|| Err(ProviderError::Malformed("empty script".to_string()))),
        }
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn settings(&self) -> &LlmSettings {
        &self.settings
    }
}

/// Configuration used by pipeline tests: local embeddings, default limits.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.embedding.dimension = 256;
    config.providers.openai.api_key = Some("sk-test".to_string());
    config
}

pub fn orchestrator(
    config: AppConfig,
    database: &Arc<MockDatabase>,
    llm: &Arc<ScriptedLlm>,
) -> Arc<QueryOrchestrator> {
    let embedder = Arc::new(HashingEmbedder::new(config.embedding.dimension));
    Arc::new(QueryOrchestrator::new(
        config,
        Arc::clone(database) as Arc<dyn DatabaseClient>,
        Arc::clone(llm) as Arc<dyn LlmProvider>,
        embedder,
    ))
}
