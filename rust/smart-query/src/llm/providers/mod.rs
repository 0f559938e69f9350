//! LLM provider implementations.

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;

use super::{LlmProvider, LlmSettings, Provider};
use crate::error::ProviderError;

/// Create a provider for the given settings.
pub fn create_provider(settings: LlmSettings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match settings.provider {
        Provider::OpenAi | Provider::Groq | Provider::Custom => {
            Ok(Arc::new(OpenAiProvider::new(settings)?))
        }
        Provider::Anthropic => Ok(Arc::new(AnthropicProvider::new(settings)?)),
    }
}
