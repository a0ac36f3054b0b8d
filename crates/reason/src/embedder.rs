//! Embedding capability
//!
//! Dense vectors for turn utterances, used for both retrieval and
//! persistence. The HTTP implementation targets an Ollama-style
//! `/api/embed` endpoint and validates the configured dimension.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::ReasonError;

/// Embedder configuration.
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub endpoint: String,
    pub model: String,
    pub embedding_dim: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "all-minilm:l6-v2".to_string(),
            embedding_dim: 384,
        }
    }
}

/// Embedding backend trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ReasonError>;

    /// Configured vector dimension.
    fn dim(&self) -> usize;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama-style HTTP embedder.
pub struct HttpEmbedder {
    client: Client,
    config: EmbedderConfig,
}

impl HttpEmbedder {
    pub fn new(config: EmbedderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ReasonError> {
        let url = format!("{}/api/embed", self.config.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.config.model,
                input: text,
            })
            .send()
            .await
            .map_err(|e| ReasonError::Embedding(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReasonError::Embedding(format!("{} - {}", status, body)));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ReasonError::Embedding(format!("bad response: {}", e)))?;

        let embedding = parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ReasonError::Embedding("no embedding returned".to_string()))?;

        if embedding.len() != self.config.embedding_dim {
            return Err(ReasonError::Embedding(format!(
                "dimension mismatch: expected {}, got {}",
                self.config.embedding_dim,
                embedding.len()
            )));
        }
        Ok(embedding)
    }

    fn dim(&self) -> usize {
        self.config.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EmbedderConfig::default();
        assert_eq!(config.embedding_dim, 384);
    }
}
