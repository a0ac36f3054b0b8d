//! Conversation data model
//!
//! Turns are immutable once written; sessions are mutable during their
//! lifetime and finalized exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-stage latency of one completed turn, milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnLatency {
    pub stt_ms: u32,
    pub reason_ms: u32,
    pub tts_ms: u32,
    pub total_ms: u32,
}

/// Input for persisting a turn. The store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub user_id: String,
    pub agent_id: String,
    pub room_id: Option<String>,
    pub session_id: Option<String>,
    pub turn_index: u32,
    pub user_utterance: String,
    pub agent_reply: String,
    pub embedding: Vec<f32>,
    pub latency: TurnLatency,
    /// Model id that produced the reply, when known.
    pub llm_model: Option<String>,
}

/// A persisted turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    pub room_id: Option<String>,
    pub session_id: Option<String>,
    pub turn_index: u32,
    pub user_utterance: String,
    pub agent_reply: String,
    pub latency: TurnLatency,
    pub llm_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session lifecycle state. Transitions only `Active -> Ended` or
/// `Active -> Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Ended,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ended" => Self::Ended,
            "error" => Self::Error,
            _ => Self::Active,
        }
    }

    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        matches!(
            (self, target),
            (Self::Active, Self::Ended) | (Self::Active, Self::Error)
        )
    }
}

/// Observed media connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excellent" => Some(Self::Excellent),
            "good" => Some(Self::Good),
            "fair" => Some(Self::Fair),
            "poor" => Some(Self::Poor),
            _ => None,
        }
    }
}

/// A participant session row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub room_id: Option<String>,
    pub participant_id: Option<String>,
    pub user_id: String,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_s: Option<u32>,
    pub total_turns: u32,
    pub avg_latency_ms: u32,
    pub p95_latency_ms: u32,
    pub p99_latency_ms: u32,
    pub status: SessionStatus,
    pub connection_quality: Option<ConnectionQuality>,
}

impl SessionRecord {
    pub fn open(
        id: impl Into<String>,
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        room_id: Option<String>,
        participant_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            room_id,
            participant_id,
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_s: None,
            total_turns: 0,
            avg_latency_ms: 0,
            p95_latency_ms: 0,
            p99_latency_ms: 0,
            status: SessionStatus::Active,
            connection_quality: None,
        }
    }

    /// Finalize the session. Returns false when the status transition is not
    /// allowed (already finalized).
    pub fn finalize(&mut self, status: SessionStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        let ended = Utc::now();
        self.duration_s = Some((ended - self.started_at).num_seconds().max(0) as u32);
        self.ended_at = Some(ended);
        self.status = status;
        true
    }
}

/// Generation constraints forwarded with a brain request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConstraints {
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout_ms: u64,
}

impl Default for BrainConstraints {
    fn default() -> Self {
        Self {
            max_tokens: 150,
            temperature: 0.7,
            timeout_ms: 5000,
        }
    }
}

/// Request payload on `agent.brain.request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainRequest {
    pub request_id: String,
    pub user_id: String,
    pub session_id: String,
    pub conversation_id: String,
    pub turn_index: u32,
    pub user_utterance: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    #[serde(default)]
    pub constraints: BrainConstraints,
    /// STT latency measured by the caller, carried through to the persisted
    /// turn row.
    #[serde(default)]
    pub latency_stt_ms: u32,
}

/// Reply payload for `agent.brain.request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainReply {
    pub text: String,
    pub latency_ms: u64,
    /// Index the turn was actually persisted under (may exceed the requested
    /// index after duplicate resolution).
    #[serde(default)]
    pub turn_index: u32,
    #[serde(default)]
    pub reasoning_degraded: bool,
}

/// `turn_completed` event payload on `events/conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCompleted {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub turn_index: u32,
    pub user_utterance: String,
    pub agent_reply: String,
    pub latency: TurnLatency,
    #[serde(default)]
    pub reasoning_degraded: bool,
    #[serde(default)]
    pub persist_deferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Ended));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Error));
        assert!(!SessionStatus::Ended.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Ended.can_transition_to(SessionStatus::Error));
        assert!(!SessionStatus::Error.can_transition_to(SessionStatus::Ended));
    }

    #[test]
    fn test_session_finalize_once() {
        let mut s = SessionRecord::open("s1", "u1", "agent-a", None, None);
        assert!(s.finalize(SessionStatus::Ended));
        assert_eq!(s.status, SessionStatus::Ended);
        assert!(s.ended_at.is_some());
        assert!(s.duration_s.is_some());
        // Second finalize is rejected
        assert!(!s.finalize(SessionStatus::Error));
        assert_eq!(s.status, SessionStatus::Ended);
    }

    #[test]
    fn test_connection_quality_parse() {
        assert_eq!(ConnectionQuality::parse("good"), Some(ConnectionQuality::Good));
        assert_eq!(ConnectionQuality::parse("terrible"), None);
    }

    #[test]
    fn test_brain_request_round_trip() {
        let req = BrainRequest {
            request_id: "r1".to_string(),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            conversation_id: "s1".to_string(),
            turn_index: 4,
            user_utterance: "hello".to_string(),
            context: vec![],
            constraints: BrainConstraints::default(),
            latency_stt_ms: 120,
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let parsed: BrainRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.turn_index, 4);
        assert_eq!(parsed.constraints.max_tokens, 150);
    }
}
