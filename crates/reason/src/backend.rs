//! LLM backend
//!
//! The model is called through a narrow capability interface; there is no
//! in-process hosting. The HTTP implementation targets an Ollama-style
//! `/api/chat` endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::prompt::Message;
use crate::ReasonError;

/// LLM configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Client-level timeout; per-call deadlines come from [`GenerateOptions`].
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "qwen3:4b-instruct".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            api_key: None,
            max_tokens: 150,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    /// Total deadline for the call.
    pub deadline: Duration,
}

/// LLM generation result.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub tokens: usize,
    pub total_time_ms: u64,
}

/// LLM backend trait.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a reply. Implementations honor `opts.deadline`.
    async fn generate(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
    ) -> Result<GenerationResult, ReasonError>;

    /// Check if the model endpoint is reachable.
    async fn is_available(&self) -> bool;

    fn model_name(&self) -> &str;

    /// Rough token count, ~4 graphemes per token.
    fn estimate_tokens(&self, text: &str) -> usize {
        (text.graphemes(true).count().max(1) + 3) / 4
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    num_predict: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    eval_count: usize,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Ollama-style HTTP backend.
pub struct OllamaBackend {
    client: Client,
    config: LlmConfig,
}

impl OllamaBackend {
    pub fn new(config: LlmConfig) -> Result<Self, ReasonError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ReasonError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn generate(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
    ) -> Result<GenerationResult, ReasonError> {
        let start = Instant::now();
        let url = format!("{}/api/chat", self.config.endpoint);

        let request = ChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            options: ChatOptions {
                num_predict: opts.max_tokens,
                temperature: opts.temperature,
            },
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::time::timeout(opts.deadline, builder.send())
            .await
            .map_err(|_| ReasonError::LlmTimeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    ReasonError::LlmTimeout
                } else {
                    ReasonError::Llm(format!("request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReasonError::Llm(format!("{} - {}", status, body)));
        }

        let remaining = opts.deadline.saturating_sub(start.elapsed());
        let chat: ChatResponse = tokio::time::timeout(remaining, response.json())
            .await
            .map_err(|_| ReasonError::LlmTimeout)?
            .map_err(|e| ReasonError::Llm(format!("bad response: {}", e)))?;

        let text = chat.message.content.trim().to_string();
        if text.is_empty() {
            return Err(ReasonError::Llm("empty completion".to_string()));
        }

        Ok(GenerationResult {
            tokens: if chat.eval_count > 0 {
                chat.eval_count
            } else {
                self.estimate_tokens(&text)
            },
            text,
            total_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.endpoint);
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.client.get(&url).send()).await,
            Ok(Ok(resp)) if resp.status().is_success()
        )
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = LlmConfig::default();
        assert_eq!(config.max_tokens, 150);
        assert_eq!(config.endpoint, "http://localhost:11434");
    }

    #[test]
    fn test_token_estimate() {
        let backend = OllamaBackend::new(LlmConfig::default()).unwrap();
        assert_eq!(backend.estimate_tokens(""), 1);
        let estimate = backend.estimate_tokens("It's 14:05 in Tokyo right now.");
        assert!(estimate >= 5 && estimate <= 12, "estimate was {}", estimate);
    }
}
