//! Turn persistence
//!
//! Turns are immutable once written. The conditional insert makes
//! `(user_id, agent_id, turn_index)` uniqueness an atomic storage-level
//! check; callers retry with the next index on `DuplicateTurn`.

use chrono::{DateTime, Utc};
use scylla::frame::response::result::CqlValue;
use uuid::Uuid;

use colloquy_core::{Turn, TurnRecord};

use crate::client::DbClient;
use crate::error::MemoryError;

/// Store for turn rows.
#[derive(Clone)]
pub struct TurnStore {
    client: DbClient,
}

impl TurnStore {
    pub fn new(client: DbClient) -> Self {
        Self { client }
    }

    /// Insert a turn. Fails with `DuplicateTurn` when the index is taken.
    pub async fn insert(&self, record: &TurnRecord) -> Result<Turn, MemoryError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let query = format!(
            "INSERT INTO {}.turns (
                user_id, agent_id, turn_index, id, room_id, session_id,
                user_utterance, agent_reply, embedding,
                latency_stt_ms, latency_reason_ms, latency_tts_ms, latency_total_ms,
                llm_model, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
            self.client.keyspace()
        );

        let result = self
            .client
            .session()
            .query_unpaged(
                query,
                (
                    &record.user_id,
                    &record.agent_id,
                    record.turn_index as i32,
                    id,
                    &record.room_id,
                    &record.session_id,
                    &record.user_utterance,
                    &record.agent_reply,
                    &record.embedding,
                    record.latency.stt_ms as i32,
                    record.latency.reason_ms as i32,
                    record.latency.tts_ms as i32,
                    record.latency.total_ms as i32,
                    &record.llm_model,
                    created_at.timestamp_millis(),
                ),
            )
            .await?;

        // LWT result: first column of the first row is [applied]
        let applied = result
            .rows
            .as_ref()
            .and_then(|rows| rows.first())
            .and_then(|row| row.columns.first())
            .map(|col| matches!(col, Some(CqlValue::Boolean(true))))
            .unwrap_or(false);

        if !applied {
            return Err(MemoryError::DuplicateTurn {
                user_id: record.user_id.clone(),
                agent_id: record.agent_id.clone(),
                turn_index: record.turn_index,
            });
        }

        // Denormalized recency row. Written after the LWT succeeded so a
        // duplicate attempt never pollutes the recency view.
        let recency_query = format!(
            "INSERT INTO {}.turns_by_user (user_id, created_at, id, text) VALUES (?, ?, ?, ?)",
            self.client.keyspace()
        );
        let text = format!(
            "User: {}\nAgent: {}",
            record.user_utterance, record.agent_reply
        );
        self.client
            .session()
            .query_unpaged(
                recency_query,
                (&record.user_id, created_at.timestamp_millis(), id, &text),
            )
            .await?;

        tracing::debug!(
            turn_id = %id,
            user_id = %record.user_id,
            agent_id = %record.agent_id,
            turn_index = record.turn_index,
            "Turn persisted"
        );

        Ok(Turn {
            id,
            user_id: record.user_id.clone(),
            agent_id: record.agent_id.clone(),
            room_id: record.room_id.clone(),
            session_id: record.session_id.clone(),
            turn_index: record.turn_index,
            user_utterance: record.user_utterance.clone(),
            agent_reply: record.agent_reply.clone(),
            latency: record.latency,
            llm_model: record.llm_model.clone(),
            created_at,
        })
    }

    /// Look up one turn.
    pub async fn get(
        &self,
        user_id: &str,
        agent_id: &str,
        turn_index: u32,
    ) -> Result<Option<Turn>, MemoryError> {
        let query = format!(
            "SELECT user_id, agent_id, turn_index, id, room_id, session_id,
                    user_utterance, agent_reply,
                    latency_stt_ms, latency_reason_ms, latency_tts_ms, latency_total_ms,
                    llm_model, created_at
             FROM {}.turns WHERE user_id = ? AND agent_id = ? AND turn_index = ?",
            self.client.keyspace()
        );

        let result = self
            .client
            .session()
            .query_unpaged(query, (user_id, agent_id, turn_index as i32))
            .await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(Self::row_to_turn(row)?));
            }
        }
        Ok(None)
    }

    /// Most recent turns for a user, newest first.
    pub async fn recent(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<(Uuid, String)>, MemoryError> {
        let query = format!(
            "SELECT id, text FROM {}.turns_by_user WHERE user_id = ? LIMIT ?",
            self.client.keyspace()
        );

        let result = self
            .client
            .session()
            .query_unpaged(query, (user_id, limit as i32))
            .await?;

        let mut turns = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (id, text): (Uuid, String) = row
                    .into_typed()
                    .map_err(|e| MemoryError::InvalidData(e.to_string()))?;
                turns.push((id, text));
            }
        }
        Ok(turns)
    }

    /// One-shot liveness query.
    pub async fn health(&self) -> bool {
        self.client
            .session()
            .query_unpaged("SELECT release_version FROM system.local", &[])
            .await
            .is_ok()
    }

    fn row_to_turn(row: scylla::frame::response::result::Row) -> Result<Turn, MemoryError> {
        let (
            user_id,
            agent_id,
            turn_index,
            id,
            room_id,
            session_id,
            user_utterance,
            agent_reply,
            latency_stt_ms,
            latency_reason_ms,
            latency_tts_ms,
            latency_total_ms,
            llm_model,
            created_at,
        ): (
            String,
            String,
            i32,
            Uuid,
            Option<String>,
            Option<String>,
            String,
            String,
            i32,
            i32,
            i32,
            i32,
            Option<String>,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| MemoryError::InvalidData(e.to_string()))?;

        Ok(Turn {
            id,
            user_id,
            agent_id,
            room_id,
            session_id,
            turn_index: turn_index.max(0) as u32,
            user_utterance,
            agent_reply,
            latency: colloquy_core::TurnLatency {
                stt_ms: latency_stt_ms.max(0) as u32,
                reason_ms: latency_reason_ms.max(0) as u32,
                tts_ms: latency_tts_ms.max(0) as u32,
                total_ms: latency_total_ms.max(0) as u32,
            },
            llm_model,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        })
    }
}
