//! Conversation memory for the voice agent
//!
//! Pairs a ScyllaDB row store (turn uniqueness, recency, session rows) with
//! a Qdrant ANN index (semantic similarity over embeddings). Every
//! similarity query is filtered by `user_id` before scoring; the store never
//! exposes cross-user turns.

pub mod client;
mod error;
pub mod schema;
pub mod sessions;
pub mod turns;
pub mod vector;

pub use client::{DbClient, DbConfig};
pub use error::MemoryError;
pub use sessions::{InMemorySessionStore, ScyllaSessionStore, SessionStore};
pub use turns::TurnStore;
pub use vector::{SimilarTurn, TurnIndex, TurnIndexConfig, VectorDistance};

use std::sync::Arc;

use colloquy_core::{Turn, TurnRecord};
use uuid::Uuid;

/// Memory store configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub db: DbConfig,
    pub index: TurnIndexConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            index: TurnIndexConfig::default(),
        }
    }
}

/// Facade over the row store and the ANN index.
///
/// `save_turn` is atomic at the row level: the lightweight-transaction
/// insert either lands the full row or reports `DuplicateTurn`. The ANN
/// upsert that follows is index maintenance; its failure degrades recall
/// (callers fall back to `recent_turns`) but never corrupts the row store.
pub struct TurnMemory {
    turns: TurnStore,
    sessions: ScyllaSessionStore,
    index: TurnIndex,
    embedding_dim: usize,
}

impl TurnMemory {
    /// Connect both backends and ensure schema and collection exist.
    pub async fn connect(config: MemoryConfig) -> Result<Self, MemoryError> {
        let embedding_dim = config.index.vector_dim;
        let client = DbClient::connect(config.db).await?;
        client.ensure_schema().await?;

        let index = TurnIndex::new(config.index).await?;
        index.ensure_collection().await?;

        Ok(Self {
            turns: TurnStore::new(client.clone()),
            sessions: ScyllaSessionStore::new(client),
            index,
            embedding_dim,
        })
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        Arc::new(self.sessions.clone())
    }

    /// Persist a turn. Fails with `DimensionMismatch` before touching
    /// storage and with `DuplicateTurn` when `(user_id, agent_id,
    /// turn_index)` already exists.
    pub async fn save_turn(&self, record: TurnRecord) -> Result<Turn, MemoryError> {
        if record.embedding.len() != self.embedding_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: record.embedding.len(),
            });
        }
        if record.user_id.is_empty() || record.agent_id.is_empty() {
            return Err(MemoryError::InvalidData(
                "user_id and agent_id must be non-empty".to_string(),
            ));
        }
        if record.user_utterance.is_empty() || record.agent_reply.is_empty() {
            return Err(MemoryError::InvalidData(
                "utterance and reply must be non-empty".to_string(),
            ));
        }

        let turn = self.turns.insert(&record).await?;

        if let Err(e) = self.index.upsert_turn(&turn, &record.embedding).await {
            tracing::warn!(
                turn_id = %turn.id,
                user_id = %turn.user_id,
                error = %e,
                "ANN upsert failed, similarity recall degraded for this turn"
            );
            metrics::counter!("errors_total", "kind" => "index_upsert_failed").increment(1);
        }

        Ok(turn)
    }

    /// Top-k semantically similar prior turns for a user, ascending by
    /// distance. Returns fewer than `k` when the user has fewer turns.
    pub async fn similar_turns(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<SimilarTurn>, MemoryError> {
        if query_embedding.len() != self.embedding_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: query_embedding.len(),
            });
        }
        self.index.search(user_id, query_embedding, k).await
    }

    /// Most recent turns for a user, newest first. Serves as fallback
    /// context when the similarity index is cold.
    pub async fn recent_turns(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<(Uuid, String)>, MemoryError> {
        self.turns.recent(user_id, limit).await
    }

    /// One-shot liveness of both backends.
    pub async fn health(&self) -> bool {
        self.turns.health().await && self.index.health().await
    }
}
