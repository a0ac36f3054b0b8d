//! Session registry
//!
//! Owns the live session handles and the shared collaborators injected
//! into each session task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::session::{SessionDeps, VoiceSession, VoiceSessionConfig, VoiceSessionHandle};

/// Manager-level configuration applied to every session.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub agent_id: String,
    pub queue_capacity: usize,
    pub turn_deadline: Duration,
    pub reason_deadline: Duration,
    pub stt_deadline: Duration,
    pub tts_first_chunk_deadline: Duration,
    /// Grace period for session tasks to drain on shutdown.
    pub drain_deadline: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        let session = VoiceSessionConfig::default();
        Self {
            agent_id: session.agent_id,
            queue_capacity: session.queue_capacity,
            turn_deadline: session.turn_deadline,
            reason_deadline: session.reason_deadline,
            stt_deadline: session.stt_deadline,
            tts_first_chunk_deadline: session.tts_first_chunk_deadline,
            drain_deadline: Duration::from_secs(2),
        }
    }
}

/// Registry of live voice sessions.
pub struct SessionManager {
    config: SessionManagerConfig,
    deps: SessionDeps,
    sessions: DashMap<String, Arc<VoiceSessionHandle>>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            sessions: DashMap::new(),
        }
    }

    /// Open a session for a joining participant and start its task.
    pub fn open_session(
        &self,
        user_id: impl Into<String>,
        room_id: Option<String>,
        participant_id: Option<String>,
    ) -> Arc<VoiceSessionHandle> {
        let config = VoiceSessionConfig {
            user_id: user_id.into(),
            agent_id: self.config.agent_id.clone(),
            room_id,
            participant_id,
            queue_capacity: self.config.queue_capacity,
            turn_deadline: self.config.turn_deadline,
            reason_deadline: self.config.reason_deadline,
            stt_deadline: self.config.stt_deadline,
            tts_first_chunk_deadline: self.config.tts_first_chunk_deadline,
            ..Default::default()
        };

        let handle = VoiceSession::spawn(config, self.deps.clone());
        self.sessions
            .insert(handle.session_id().to_string(), handle.clone());
        tracing::info!(session_id = %handle.session_id(), user_id = %handle.user_id(), "Session opened");
        handle
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<VoiceSessionHandle>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Drop a finished session from the registry.
    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session: request leave, wait up to the drain deadline,
    /// then abort stragglers.
    pub async fn close_all(&self, reason: &str) {
        let handles: Vec<Arc<VoiceSessionHandle>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        for handle in &handles {
            handle.leave(reason).await;
        }
        for handle in &handles {
            if tokio::time::timeout(self.config.drain_deadline, handle.join())
                .await
                .is_err()
            {
                tracing::warn!(session_id = %handle.session_id(), "Session drain deadline exceeded, aborting");
                handle.abort();
            }
        }
    }
}
