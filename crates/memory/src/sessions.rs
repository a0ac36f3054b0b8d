//! Session persistence
//!
//! The session task is the sole in-memory writer of its row; the store just
//! serializes whole-row upserts. An in-memory implementation backs tests
//! and broker-less development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use colloquy_core::{ConnectionQuality, SessionRecord, SessionStatus};

use crate::client::DbClient;
use crate::error::MemoryError;

/// Store for session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite the full session row.
    async fn upsert(&self, session: &SessionRecord) -> Result<(), MemoryError>;

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, MemoryError>;
}

/// ScyllaDB implementation.
#[derive(Clone)]
pub struct ScyllaSessionStore {
    client: DbClient,
}

impl ScyllaSessionStore {
    pub fn new(client: DbClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionStore for ScyllaSessionStore {
    async fn upsert(&self, session: &SessionRecord) -> Result<(), MemoryError> {
        let query = format!(
            "INSERT INTO {}.sessions (
                id, room_id, participant_id, user_id, agent_id,
                started_at, ended_at, duration_s,
                total_turns, avg_latency_ms, p95_latency_ms, p99_latency_ms,
                status, connection_quality
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &session.id,
                    &session.room_id,
                    &session.participant_id,
                    &session.user_id,
                    &session.agent_id,
                    session.started_at.timestamp_millis(),
                    session.ended_at.map(|t| t.timestamp_millis()),
                    session.duration_s.map(|d| d as i32),
                    session.total_turns as i32,
                    session.avg_latency_ms as i32,
                    session.p95_latency_ms as i32,
                    session.p99_latency_ms as i32,
                    session.status.as_str(),
                    session.connection_quality.map(|q| q.as_str()),
                ),
            )
            .await?;

        tracing::debug!(session_id = %session.id, status = %session.status.as_str(), "Session row upserted");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, MemoryError> {
        let query = format!(
            "SELECT id, room_id, participant_id, user_id, agent_id,
                    started_at, ended_at, duration_s,
                    total_turns, avg_latency_ms, p95_latency_ms, p99_latency_ms,
                    status, connection_quality
             FROM {}.sessions WHERE id = ?",
            self.client.keyspace()
        );

        let result = self.client.session().query_unpaged(query, (id,)).await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(row_to_session(row)?));
            }
        }
        Ok(None)
    }
}

fn row_to_session(row: scylla::frame::response::result::Row) -> Result<SessionRecord, MemoryError> {
    let (
        id,
        room_id,
        participant_id,
        user_id,
        agent_id,
        started_at,
        ended_at,
        duration_s,
        total_turns,
        avg_latency_ms,
        p95_latency_ms,
        p99_latency_ms,
        status,
        connection_quality,
    ): (
        String,
        Option<String>,
        Option<String>,
        String,
        String,
        i64,
        Option<i64>,
        Option<i32>,
        i32,
        i32,
        i32,
        i32,
        String,
        Option<String>,
    ) = row
        .into_typed()
        .map_err(|e| MemoryError::InvalidData(e.to_string()))?;

    Ok(SessionRecord {
        id,
        room_id,
        participant_id,
        user_id,
        agent_id,
        started_at: DateTime::from_timestamp_millis(started_at).unwrap_or_else(Utc::now),
        ended_at: ended_at.and_then(DateTime::from_timestamp_millis),
        duration_s: duration_s.map(|d| d.max(0) as u32),
        total_turns: total_turns.max(0) as u32,
        avg_latency_ms: avg_latency_ms.max(0) as u32,
        p95_latency_ms: p95_latency_ms.max(0) as u32,
        p99_latency_ms: p99_latency_ms.max(0) as u32,
        status: SessionStatus::parse(&status),
        connection_quality: connection_quality.as_deref().and_then(ConnectionQuality::parse),
    })
}

/// In-memory implementation for tests and broker-less development.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, session: &SessionRecord) -> Result<(), MemoryError> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, MemoryError> {
        Ok(self.sessions.read().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemorySessionStore::new();
        let mut session = SessionRecord::open("s1", "u1", "agent-a", None, None);
        store.upsert(&session).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.total_turns, 0);

        session.total_turns = 3;
        session.finalize(SessionStatus::Ended);
        store.upsert(&session).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Ended);
        assert_eq!(loaded.total_turns, 3);
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_in_memory_missing() {
        let store = InMemorySessionStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
