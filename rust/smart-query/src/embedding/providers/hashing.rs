//! Deterministic local embedder based on feature hashing.
//!
//! Works offline and gives the same vector for the same text on every run.
//! Features are normalized word tokens plus character trigrams, so
//! `customer`, `customers` and `customer_id` land close to each other.

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::ProviderError;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.35;

/// Filler words of schema descriptions and questions.
const STOPWORDS: &[&str] = &[
    "a", "all", "an", "and", "are", "by", "column", "contain", "data", "example", "for", "from",
    "get", "give", "how", "in", "is", "list", "many", "me", "of", "or", "sample", "show",
    "table", "the", "to", "top", "type", "value", "what", "which", "with",
];

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Embed synchronously; the async trait methods delegate here.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        for word in tokenize(text) {
            self.add_feature(&mut vector, word.as_bytes(), WORD_WEIGHT);
            let padded: Vec<char> = format!("#{word}#").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, gram.as_bytes(), TRIGRAM_WEIGHT);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        #[allow(clippy::cast_possible_truncation, reason = "modulo keeps the value below dimension")]
        let slot = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Lowercased word tokens with snake_case and camelCase split, numbers and
/// stopwords dropped, and a plural `s` removed.
fn tokenize(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    let flush = |current: &mut String, words: &mut Vec<String>| {
        if !current.is_empty() {
            words.push(std::mem::take(current));
        }
    };

    for c in text.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower {
                flush(&mut current, &mut words);
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        } else {
            flush(&mut current, &mut words);
            prev_lower = false;
        }
    }
    flush(&mut current, &mut words);

    words
        .into_iter()
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .map(|w| singular(&w))
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn singular(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Column total_amount in table orders of type Float64"),
            vec!["total", "amount", "order", "float64"]
        );
        assert_eq!(tokenize("createdAt"), vec!["created", "at"]);
        assert_eq!(tokenize("Show me the top 10 customers"), vec!["customer"]);
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_text("customers by revenue");
        let b = embedder.embed_text("customers by revenue");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_text("the of in").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_related_text_scores_higher() {
        let embedder = HashingEmbedder::new(384);
        let question = embedder.embed_text("top 10 customers by revenue");
        let customers = embedder.embed_text("Table customers with columns: id, name, revenue");
        let products = embedder.embed_text("Table products with columns: sku, title, weight");
        assert!(
            cosine_similarity(&question, &customers) > cosine_similarity(&question, &products)
        );
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["orders".to_string(), "customers".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], embedder.embed_text("customers"));
        assert_eq!(embedder.embed("orders").await.unwrap(), vectors[0]);
    }
}
