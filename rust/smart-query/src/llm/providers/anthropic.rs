//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::ProviderError;
use crate::llm::{LlmProvider, LlmSettings, Prompt, Provider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Claude client.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    settings: LlmSettings,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(settings: LlmSettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { settings, client })
    }

    fn api_url(&self) -> String {
        format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "system": prompt.system,
            "messages": [{ "role": "user", "content": prompt.user }],
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let timeout = self.settings.timeout;
        let api_key = self.settings.api_key.as_ref().ok_or_else(|| ProviderError::Http {
            status: 401,
            message: "Anthropic API key is not configured".to_string(),
        })?;

        let response = self
            .client
            .post(self.api_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                body = %text,
                "Anthropic messages request failed"
            );
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let message: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))?;

        if let Some(usage) = &message.usage {
            tracing::debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = message.stop_reason.as_deref().unwrap_or("unknown"),
                "Anthropic message finished"
            );
        }

        let text: String = message
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(ProviderError::Malformed(
                "response has no text content".to_string(),
            ));
        }
        Ok(text)
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn settings(&self) -> &LlmSettings {
        &self.settings
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_is_top_level() {
        let provider = AnthropicProvider::new(LlmSettings {
            provider: Provider::Anthropic,
            base_url: Provider::Anthropic.default_base_url().to_string(),
            ..LlmSettings::default()
        })
        .unwrap();
        let body = provider.request_body(&Prompt::new("be terse", "count rows"));
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(provider.api_url(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_text_blocks_joined() {
        let raw = r#"{"content":[{"type":"text","text":"SELECT "},{"type":"text","text":"1"}],"stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":2}}"#;
        let message: MessagesResponse = serde_json::from_str(raw).unwrap();
        let text: String = message.content.into_iter().filter_map(|b| b.text).collect();
        assert_eq!(text, "SELECT 1");
    }
}
