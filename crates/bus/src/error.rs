//! Bus error taxonomy

use colloquy_core::{CoreError, WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("not connected to bus")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote error: {} ({})", .0.kind, .0.message)]
    RemoteError(WireError),

    #[error("producer error: {0}")]
    ProducerError(String),

    #[error("consumer error: {0}")]
    ConsumerError(String),
}

impl BusError {
    /// Stable kind string for `errors_total{kind}` and wire errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSubject(_) => "invalid_subject",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::MalformedMessage(_) => "malformed_message",
            Self::NotConnected => "not_connected",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Timeout => "timeout",
            Self::RemoteError(_) => "remote_error",
            Self::ProducerError(_) => "producer_error",
            Self::ConsumerError(_) => "consumer_error",
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<CoreError> for BusError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidSubject(s) => Self::InvalidSubject(s),
            CoreError::InvalidTopic(t) => Self::InvalidTopic(t),
            CoreError::MalformedMessage(m) => Self::MalformedMessage(m),
        }
    }
}
