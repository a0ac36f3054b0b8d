//! Core error types

use thiserror::Error;

/// Errors raised by the core envelope and namespace layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl CoreError {
    /// Stable kind string used in `errors_total{kind}` and wire errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSubject(_) => "invalid_subject",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::MalformedMessage(_) => "malformed_message",
        }
    }
}
