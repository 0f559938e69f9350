//! Configuration validation for Smart Query.
//!
//! Runs once at startup and reports every problem at once, so a broken
//! deployment can be fixed in a single pass.

use super::error::{ConfigResult, ConfigurationError};
use super::{AppConfig, EmbeddingProviderKind};

/// Statement verbs that never modify data.
pub const READ_ONLY_STATEMENTS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "EXPLAIN", "EXISTS"];

/// Fixed output size of `text-embedding-ada-002`.
const ADA_DIMENSION: usize = 1536;

/// Headroom for retrieval and validation around the synthesis attempts.
pub const SYNTHESIS_MARGIN_SECS: u64 = 10;

/// Checks the loaded configuration before any component is built.
///
/// | Section    | Rule                                                       |
/// |------------|------------------------------------------------------------|
/// | llm        | known provider, API key present, timeout > 0               |
/// | embedding  | dimension > 0, batch size > 0, OpenAI key for `openai`     |
/// |            | ada-002 only with dimension 1536                           |
/// | retrieval  | top_k > 0, fallback entity budget > 0                      |
/// | validator  | default limit > 0, allow-list non-empty and read-only      |
/// | pipeline   | synthesis retries ≤ 1, request timeout > 0                 |
/// |            | deadline covers every LLM attempt plus a margin            |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        for result in [
            Self::validate_llm_config(config),
            Self::validate_embedding_config(config),
            Self::validate_retrieval_config(config),
            Self::validate_validator_config(config),
            Self::validate_pipeline_config(config),
        ] {
            match result {
                Ok(()) => {}
                Err(ConfigurationError::Multiple(errs)) => errors.extend(errs),
                Err(e) => errors.push(e),
            }
        }

        ConfigurationError::collect(errors)
    }

    /// The selected provider must exist and carry credentials.
    pub fn validate_llm_config(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let providers = &config.providers;

        let (key, env_var) = match config.llm.provider.as_str() {
            "openai" => (providers.openai.api_key.as_ref(), "OPENAI_API_KEY"),
            "anthropic" => (providers.anthropic.api_key.as_ref(), "ANTHROPIC_API_KEY"),
            "groq" => (providers.groq.api_key.as_ref(), "GROQ_API_KEY"),
            name if providers.custom.contains_key(name) => {
                // Self-hosted OpenAI-compatible endpoints often run without a key.
                if providers.custom[name].base_url.is_none() {
                    errors.push(ConfigurationError::missing_required(
                        format!("providers.custom.{name}.base_url"),
                        "Custom OpenAI-compatible provider",
                        format!("SMART_QUERY__PROVIDERS__CUSTOM__{}__BASE_URL", name.to_uppercase()),
                    ));
                }
                (None, "")
            }
            other => {
                errors.push(ConfigurationError::invalid(
                    format!("llm.provider has unknown value '{other}'"),
                    "Set SMART_QUERY__LLM__PROVIDER to openai, anthropic, groq, or a name \
                    configured under providers.custom",
                ));
                (None, "")
            }
        };

        if !env_var.is_empty() && !key.is_some_and(|k| !k.is_empty()) {
            errors.push(ConfigurationError::missing_required(
                format!("{} API key", config.llm.provider),
                "SQL synthesis",
                env_var,
            ));
        }

        if config.llm.timeout_secs == 0 {
            errors.push(ConfigurationError::out_of_range(
                "llm.timeout_secs",
                0,
                "at least 1 second",
            ));
        }

        ConfigurationError::collect(errors)
    }

    pub fn validate_embedding_config(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let embedding = &config.embedding;

        if embedding.dimension == 0 {
            errors.push(ConfigurationError::out_of_range(
                "embedding.dimension",
                0,
                "a positive vector length",
            ));
        }
        if embedding.batch_size == 0 {
            errors.push(ConfigurationError::out_of_range(
                "embedding.batch_size",
                0,
                "at least 1",
            ));
        }
        if embedding.timeout_secs == 0 {
            errors.push(ConfigurationError::out_of_range(
                "embedding.timeout_secs",
                0,
                "at least 1 second",
            ));
        }
        if embedding.provider == EmbeddingProviderKind::OpenAi
            && !config
                .providers
                .openai
                .api_key
                .as_ref()
                .is_some_and(|k| !k.is_empty())
        {
            errors.push(ConfigurationError::missing_required(
                "OpenAI API key",
                "Schema embeddings with embedding.provider = openai",
                "OPENAI_API_KEY (or set SMART_QUERY__EMBEDDING__PROVIDER=hashing)",
            ));
        }
        if embedding.provider == EmbeddingProviderKind::OpenAi
            && embedding.model == "text-embedding-ada-002"
            && embedding.dimension != ADA_DIMENSION
        {
            errors.push(ConfigurationError::incompatible(
                format!("embedding.model={}", embedding.model),
                format!("embedding.dimension={}", embedding.dimension),
                format!(
                    "this model always returns {ADA_DIMENSION}-dimensional vectors; \
                    only text-embedding-3 models accept a custom dimension"
                ),
            ));
        }

        ConfigurationError::collect(errors)
    }

    pub fn validate_retrieval_config(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if config.retrieval.top_k == 0 {
            errors.push(ConfigurationError::out_of_range(
                "retrieval.top_k",
                0,
                "at least 1",
            ));
        }
        if config.retrieval.fallback_entity_budget == 0 {
            errors.push(ConfigurationError::out_of_range(
                "retrieval.fallback_entity_budget",
                0,
                "at least 1",
            ));
        }
        ConfigurationError::collect(errors)
    }

    pub fn validate_validator_config(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let validator = &config.validator;

        if validator.default_limit == 0 {
            errors.push(ConfigurationError::out_of_range(
                "validator.default_limit",
                0,
                "a positive row count",
            ));
        }
        if validator.max_query_length == 0 {
            errors.push(ConfigurationError::out_of_range(
                "validator.max_query_length",
                0,
                "a positive character count",
            ));
        }
        if validator.allowed_statements.is_empty() {
            errors.push(ConfigurationError::invalid(
                "validator.allowed_statements is empty, so no query could ever run",
                "Allow at least SELECT",
            ));
        }
        for verb in &validator.allowed_statements {
            if !READ_ONLY_STATEMENTS.contains(&verb.to_uppercase().as_str()) {
                errors.push(ConfigurationError::invalid(
                    format!("validator.allowed_statements contains '{verb}'"),
                    format!(
                        "Only read-only statements may be allowed: {}",
                        READ_ONLY_STATEMENTS.join(", ")
                    ),
                ));
            }
        }

        ConfigurationError::collect(errors)
    }

    pub fn validate_pipeline_config(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let pipeline = &config.pipeline;

        if pipeline.synthesis_retries > 1 {
            errors.push(ConfigurationError::out_of_range(
                "pipeline.synthesis_retries",
                pipeline.synthesis_retries,
                "0 or 1",
            ));
        }
        if pipeline.request_timeout_secs == 0 {
            errors.push(ConfigurationError::out_of_range(
                "pipeline.request_timeout_secs",
                0,
                "at least 1 second",
            ));
        }
        if pipeline.max_question_chars == 0 {
            errors.push(ConfigurationError::out_of_range(
                "pipeline.max_question_chars",
                0,
                "at least 1",
            ));
        }
        let attempts = 1 + u64::from(pipeline.synthesis_retries.min(1));
        let needed = attempts * config.llm.timeout_secs + SYNTHESIS_MARGIN_SECS;
        if pipeline.request_timeout_secs > 0 && pipeline.request_timeout_secs < needed {
            errors.push(ConfigurationError::incompatible(
                format!("pipeline.request_timeout_secs={}", pipeline.request_timeout_secs),
                format!(
                    "llm.timeout_secs={} x {attempts} synthesis attempts",
                    config.llm.timeout_secs
                ),
                format!(
                    "the request deadline must be at least {needed}s so a provider timeout is \
                    reported as ProviderError rather than RequestTimeout"
                ),
            ));
        }

        ConfigurationError::collect(errors)
    }
}
