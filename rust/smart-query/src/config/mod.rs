//! Configuration management for Smart Query.
//!
//! Configuration is layered: built-in defaults, then optional config files
//! (`config/smart-query.{yaml,toml,json}`), then `SMART_QUERY__*` environment
//! variables, then a handful of well-known variables (`CLICKHOUSE_*`, provider
//! API keys) that match what existing deployments already export.
//!
//! ```rust,ignore
//! use smart_query::config::{AppConfig, ConfigValidator};
//!
//! let config = AppConfig::load(None)?;
//! ConfigValidator::validate(&config)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sql::SqlDialect;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// ClickHouse connection.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// LLM provider credentials and endpoints.
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// SQL synthesis model settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Schema embedding settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Context retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// SQL safety validator settings.
    #[serde(default)]
    pub validator: ValidatorConfig,
    /// Orchestrator limits and caching.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// Sources, lowest precedence first:
    /// 1. Default values
    /// 2. `config/smart-query.*` (or `config_path` when given)
    /// 3. `SMART_QUERY__SECTION__KEY` environment variables
    /// 4. Well-known variables such as `CLICKHOUSE_HOST` and `OPENAI_API_KEY`
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(config_path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let file_source = match config_path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config/smart-query").required(false),
        };

        let config = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("database.host", "localhost")?
            .set_default("database.port", 8123)?
            .set_default("llm.provider", "openai")?
            .set_default("llm.model", "gpt-3.5-turbo")?
            .set_default("embedding.provider", "hashing")?
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("SMART_QUERY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize()?;
        app_config.apply_env_overrides();
        Ok(app_config)
    }

    /// Apply the well-known environment variables on top of loaded values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CLICKHOUSE_HOST") {
            self.database.host = host;
        }
        if let Some(port) = std::env::var("CLICKHOUSE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.database.port = port;
        }
        if let Ok(user) = std::env::var("CLICKHOUSE_USER") {
            self.database.user = user;
        }
        if let Ok(password) = std::env::var("CLICKHOUSE_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Ok(database) = std::env::var("CLICKHOUSE_DATABASE") {
            self.database.database = database;
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.providers.anthropic.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("GROQ_API_KEY") {
            self.providers.groq.api_key = Some(key);
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Allowed CORS origins; empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_http_timeout() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_http_timeout(),
            cors_origins: Vec::new(),
        }
    }
}

/// ClickHouse connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    /// HTTP interface port.
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    pub password: Option<String>,
    #[serde(default = "default_db_name")]
    pub database: String,
    /// Use HTTPS for the HTTP interface.
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_db_timeout")]
    pub timeout_secs: u64,
    /// Distinct sample values fetched per column during schema refresh.
    #[serde(default = "default_sample_values")]
    pub sample_values: usize,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    8123
}

fn default_db_user() -> String {
    "default".to_string()
}

fn default_db_name() -> String {
    "default".to_string()
}

fn default_db_timeout() -> u64 {
    30
}

fn default_sample_values() -> usize {
    3
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: None,
            database: default_db_name(),
            secure: false,
            timeout_secs: default_db_timeout(),
            sample_values: default_sample_values(),
        }
    }
}

impl DatabaseConfig {
    /// Base URL of the ClickHouse HTTP interface.
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("secure", &self.secure)
            .field("timeout_secs", &self.timeout_secs)
            .field("sample_values", &self.sample_values)
            .finish()
    }
}

/// LLM provider configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub groq: ProviderConfig,
    /// Additional OpenAI-compatible endpoints, selected with `llm.provider = "<name>"`.
    #[serde(default)]
    pub custom: HashMap<String, ProviderConfig>,
}

/// Individual provider configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    /// Base URL override.
    pub base_url: Option<String>,
    /// Default model for this provider.
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// SQL synthesis model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `openai`, `anthropic`, `groq` or a key of `providers.custom`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.1
}

fn default_llm_timeout() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which embedding provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local feature hashing, no network access.
    #[default]
    Hashing,
    /// OpenAI-compatible `/v1/embeddings`.
    OpenAi,
}

/// Schema embedding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Texts per provider request during index builds.
    #[serde(default = "default_embedding_batch")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_batch() -> usize {
    64
}

fn default_embedding_timeout() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Context retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Entities returned by similarity search.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Entity budget for the full-schema fallback context.
    #[serde(default = "default_entity_budget")]
    pub fallback_entity_budget: usize,
}

fn default_top_k() -> usize {
    10
}

fn default_entity_budget() -> usize {
    200
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fallback_entity_budget: default_entity_budget(),
        }
    }
}

/// SQL safety validator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Leading statement verbs that may be executed.
    #[serde(default = "default_allowed_statements")]
    pub allowed_statements: Vec<String>,
    /// `system.*` / `information_schema.*` relations that may be read.
    #[serde(default)]
    pub system_table_allowlist: Vec<String>,
    /// LIMIT appended when the query has none.
    #[serde(default = "default_limit")]
    pub default_limit: u64,
    /// Permit UNION / INTERSECT / EXCEPT.
    #[serde(default)]
    pub allow_set_operations: bool,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    /// JOIN keywords allowed in one statement.
    #[serde(default = "default_max_joins")]
    pub max_joins: usize,
    /// Opening parentheses allowed in one statement.
    #[serde(default = "default_max_nesting")]
    pub max_nesting: usize,
    #[serde(default)]
    pub dialect: SqlDialect,
}

fn default_allowed_statements() -> Vec<String> {
    vec!["SELECT".to_string()]
}

fn default_limit() -> u64 {
    1000
}

fn default_max_query_length() -> usize {
    10_000
}

fn default_max_joins() -> usize {
    5
}

fn default_max_nesting() -> usize {
    20
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_statements: default_allowed_statements(),
            system_table_allowlist: Vec::new(),
            default_limit: default_limit(),
            allow_set_operations: false,
            max_query_length: default_max_query_length(),
            max_joins: default_max_joins(),
            max_nesting: default_max_nesting(),
            dialect: SqlDialect::default(),
        }
    }
}

/// Orchestrator limits and caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// End-to-end deadline per request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Re-synthesis attempts after a recoverable rejection (at most 1).
    #[serde(default = "default_synthesis_retries")]
    pub synthesis_retries: u32,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Zero disables the cache.
    #[serde(default = "default_cache_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
}

fn default_request_timeout() -> u64 {
    90
}

fn default_synthesis_retries() -> u32 {
    1
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_entries() -> usize {
    1000
}

fn default_max_question_chars() -> usize {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            synthesis_retries: default_synthesis_retries(),
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_entries(),
            max_question_chars: default_max_question_chars(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
