//! OpenAI-compatible `/v1/embeddings` client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::embedding::EmbeddingProvider;
use crate::error::ProviderError;

/// Remote embedding provider.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    timeout: Duration,
    client: Client,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            api_key,
            model,
            dimension,
            timeout,
            client,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, texts: &[String]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        // Only the v3 models accept a requested output size.
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = serde_json::Value::from(self.dimension);
        }
        body
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(self.api_url()).json(&self.request_body(texts));
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %text, "Embedding request failed");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, self.timeout))?;
        into_vectors(parsed, texts.len())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn into_vectors(
    mut parsed: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if parsed.data.len() != expected {
        return Err(ProviderError::Malformed(format!(
            "expected {expected} embeddings, got {}",
            parsed.data.len()
        )));
    }
    parsed.data.sort_by_key(|d| d.index);
    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedder(model: &str) -> OpenAiEmbedder {
        OpenAiEmbedder::new(
            "https://api.openai.com/".to_string(),
            Some("sk-test".to_string()),
            model.to_string(),
            256,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_dimensions_only_for_v3_models() {
        let texts = vec!["a".to_string()];
        assert_eq!(
            embedder("text-embedding-3-small").request_body(&texts)["dimensions"],
            256
        );
        assert!(embedder("text-embedding-ada-002")
            .request_body(&texts)
            .get("dimensions")
            .is_none());
    }

    #[test]
    fn test_vectors_sorted_by_index() {
        let parsed: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
        )
        .unwrap();
        let vectors = into_vectors(parsed, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_count_mismatch_is_malformed() {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data":[{"index":0,"embedding":[1.0]}]}"#).unwrap();
        assert!(matches!(
            into_vectors(parsed, 2),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        assert!(!format!("{:?}", embedder("m")).contains("sk-test"));
    }
}
