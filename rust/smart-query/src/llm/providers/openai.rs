//! OpenAI and OpenAI-compatible provider.
//!
//! Used for OpenAI, Groq and self-hosted endpoints that implement
//! `/v1/chat/completions`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::ProviderError;
use crate::llm::{LlmProvider, LlmSettings, Prompt, Provider};

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    settings: LlmSettings,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(settings: LlmSettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { settings, client })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "stream": false,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let timeout = self.settings.timeout;
        let mut request = self.client.post(self.api_url()).json(&self.request_body(prompt));
        if let Some(ref api_key) = self.settings.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = self.settings.provider.as_str(),
                status = status.as_u16(),
                body = %text,
                "Chat completion request failed"
            );
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))?;

        if let Some(usage) = &completion.usage {
            tracing::debug!(
                model = completion.model.as_deref().unwrap_or(&self.settings.model),
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Chat completion finished"
            );
        }

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("response has no message content".to_string()))
    }

    fn provider(&self) -> Provider {
        self.settings.provider
    }

    fn settings(&self) -> &LlmSettings {
        &self.settings
    }
}

/// Non-streaming chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_trims_slash() {
        let provider = OpenAiProvider::new(LlmSettings {
            base_url: "http://localhost:8080/".to_string(),
            ..LlmSettings::default()
        })
        .unwrap();
        assert_eq!(provider.api_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_request_body() {
        let provider = OpenAiProvider::new(LlmSettings::default()).unwrap();
        let body = provider.request_body(&Prompt::new("sys", "question"));
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "question");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_completion_parsing() {
        let raw = r#"{"id":"x","model":"gpt-3.5-turbo","choices":[{"index":0,"message":{"role":"assistant","content":"SELECT 1"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":3,"total_tokens":13}}"#;
        let completion: ChatCompletion = serde_json::from_str(raw).unwrap();
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("SELECT 1")
        );
    }
}
