//! Schema creation for the conversation memory tables

use crate::error::MemoryError;
use scylla::Session;

/// Create the keyspace if it doesn't exist.
pub async fn create_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u8,
) -> Result<(), MemoryError> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );

    session
        .query_unpaged(query, &[])
        .await
        .map_err(|e| MemoryError::Schema(format!("Failed to create keyspace: {}", e)))?;

    Ok(())
}

/// Create all required tables.
pub async fn create_tables(session: &Session, keyspace: &str) -> Result<(), MemoryError> {
    // Turns, partitioned for per-(user, agent) uniqueness. The conditional
    // insert against this table is the atomicity point of save_turn.
    let turns_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.turns (
            user_id TEXT,
            agent_id TEXT,
            turn_index INT,
            id UUID,
            room_id TEXT,
            session_id TEXT,
            user_utterance TEXT,
            agent_reply TEXT,
            embedding LIST<FLOAT>,
            latency_stt_ms INT,
            latency_reason_ms INT,
            latency_tts_ms INT,
            latency_total_ms INT,
            llm_model TEXT,
            created_at TIMESTAMP,
            PRIMARY KEY ((user_id, agent_id), turn_index)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(turns_table, &[])
        .await
        .map_err(|e| MemoryError::Schema(format!("Failed to create turns table: {}", e)))?;

    // Per-user recency view, newest first. Serves recent_turns when the
    // similarity index is cold.
    let turns_by_user_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.turns_by_user (
            user_id TEXT,
            created_at TIMESTAMP,
            id UUID,
            text TEXT,
            PRIMARY KEY ((user_id), created_at, id)
        ) WITH CLUSTERING ORDER BY (created_at DESC, id DESC)
    "#,
        keyspace
    );

    session
        .query_unpaged(turns_by_user_table, &[])
        .await
        .map_err(|e| MemoryError::Schema(format!("Failed to create turns_by_user table: {}", e)))?;

    // Session rows, finalized once on disconnect/abort/idle-timeout.
    let sessions_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.sessions (
            id TEXT,
            room_id TEXT,
            participant_id TEXT,
            user_id TEXT,
            agent_id TEXT,
            started_at TIMESTAMP,
            ended_at TIMESTAMP,
            duration_s INT,
            total_turns INT,
            avg_latency_ms INT,
            p95_latency_ms INT,
            p99_latency_ms INT,
            status TEXT,
            connection_quality TEXT,
            PRIMARY KEY (id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(sessions_table, &[])
        .await
        .map_err(|e| MemoryError::Schema(format!("Failed to create sessions table: {}", e)))?;

    tracing::info!("All memory tables created");
    Ok(())
}
