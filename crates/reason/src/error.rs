//! Reasoning errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReasonError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM deadline exceeded")]
    LlmTimeout,

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ReasonError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Llm(_) => "llm_error",
            Self::LlmTimeout => "llm_timeout",
            Self::Embedding(_) => "embedding_error",
            Self::Configuration(_) => "configuration",
        }
    }
}
