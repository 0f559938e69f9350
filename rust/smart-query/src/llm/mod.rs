//! Language-model completion providers.
//!
//! SQL synthesis needs exactly one thing from a model: turn a prompt into
//! text. [`LlmProvider`] is that seam; [`providers::create_provider`] picks an
//! implementation from configuration.
//!
//! # Providers
//!
//! - [`providers::OpenAiProvider`]: OpenAI, Groq and any OpenAI-compatible API
//! - [`providers::AnthropicProvider`]: Anthropic Messages API

pub mod providers;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, ConfigResult, ConfigurationError};
use crate::error::ProviderError;

/// LLM connection and model settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL for the LLM API.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    pub provider: Provider,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: Provider::OpenAi.default_base_url().to_string(),
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            provider: Provider::OpenAi,
            max_tokens: 500,
            temperature: 0.1,
            timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmSettings {
    /// Resolve settings for the provider selected by `llm.provider`.
    pub fn from_config(config: &AppConfig) -> ConfigResult<Self> {
        let name = config.llm.provider.as_str();
        let (provider, provider_config) = match name {
            "openai" => (Provider::OpenAi, &config.providers.openai),
            "anthropic" => (Provider::Anthropic, &config.providers.anthropic),
            "groq" => (Provider::Groq, &config.providers.groq),
            other => match config.providers.custom.get(other) {
                Some(custom) => (Provider::Custom, custom),
                None => {
                    return Err(ConfigurationError::invalid(
                        format!("llm.provider has unknown value '{other}'"),
                        "Set SMART_QUERY__LLM__PROVIDER to openai, anthropic, groq, or a name \
                        configured under providers.custom",
                    ));
                }
            },
        };

        let base_url = provider_config
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string());
        if base_url.is_empty() {
            return Err(ConfigurationError::missing_required(
                format!("providers.custom.{name}.base_url"),
                "Custom OpenAI-compatible provider",
                format!("SMART_QUERY__PROVIDERS__CUSTOM__{}__BASE_URL", name.to_uppercase()),
            ));
        }

        Ok(Self {
            base_url,
            api_key: provider_config.api_key.clone(),
            model: provider_config
                .default_model
                .clone()
                .unwrap_or_else(|| config.llm.model.clone()),
            provider,
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
            timeout: config.llm.timeout(),
        })
    }
}

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI and compatible APIs.
    #[default]
    OpenAi,
    /// Anthropic Claude.
    Anthropic,
    /// Groq (OpenAI-compatible).
    Groq,
    /// Self-hosted or third-party OpenAI-compatible endpoint.
    Custom,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Groq => "https://api.groq.com/openai",
            Self::Custom => "",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Groq => "groq",
            Self::Custom => "custom",
        }
    }
}

/// A single-turn prompt: system instructions plus one user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Text completion from a language model.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete `prompt`, failing with [`ProviderError`] on transport,
    /// status or decoding problems and on timeout.
    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError>;

    fn provider(&self) -> Provider;

    fn settings(&self) -> &LlmSettings;
}
