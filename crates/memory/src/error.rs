//! Memory store errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("duplicate turn ({user_id}, {agent_id}, {turn_index})")]
    DuplicateTurn {
        user_id: String,
        agent_id: String,
        turn_index: u32,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector index error: {0}")]
    Index(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl MemoryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_failed",
            Self::Schema(_) => "schema_error",
            Self::Query(_) => "query_error",
            Self::DuplicateTurn { .. } => "duplicate_turn",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Index(_) => "index_error",
            Self::InvalidData(_) => "invalid_data",
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateTurn { .. })
    }
}

impl From<scylla::transport::errors::QueryError> for MemoryError {
    fn from(err: scylla::transport::errors::QueryError) -> Self {
        Self::Query(err.to_string())
    }
}

impl From<scylla::transport::errors::NewSessionError> for MemoryError {
    fn from(err: scylla::transport::errors::NewSessionError) -> Self {
        Self::Connection(err.to_string())
    }
}
