//! Voice session management
//!
//! One state machine per participant, orchestrating STT, reasoning and TTS
//! with voice-activity gating, barge-in, cancellation and deadline
//! enforcement. The session task owns all mutable session state; external
//! stimuli arrive through a bounded frame queue and a control channel.

pub mod manager;
pub mod queue;
pub mod session;
pub mod stats;

pub use manager::{SessionManager, SessionManagerConfig};
pub use queue::FrameQueue;
pub use session::{
    ControlEvent, SessionDeps, SessionEvent, SessionState, VoiceSession, VoiceSessionConfig,
    VoiceSessionHandle,
};
pub use stats::TurnStats;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use colloquy_bus::{BusError, DurableLog, EphemeralBus};
use colloquy_core::{subjects, BrainReply, BrainRequest, SessionRecord};

/// Reasoning dispatch seam. The production implementation sends
/// `agent.brain.request` over the ephemeral bus.
#[async_trait]
pub trait BrainClient: Send + Sync {
    async fn reason(
        &self,
        request: BrainRequest,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<BrainReply, BusError>;
}

#[async_trait]
impl BrainClient for EphemeralBus {
    async fn reason(
        &self,
        request: BrainRequest,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<BrainReply, BusError> {
        let payload = serde_json::to_value(&request)
            .map_err(|e| BusError::MalformedMessage(e.to_string()))?;
        let reply = self
            .request(subjects::BRAIN_REQUEST, payload, timeout, Some(trace_id))
            .await?;
        reply
            .payload_as::<BrainReply>()
            .map_err(|e| BusError::MalformedMessage(e.to_string()))
    }
}

/// Outbound event seam for session lifecycle, analytics and audit.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Announce a new session on the ephemeral bus.
    async fn session_started(&self, session: &SessionRecord, trace_id: &str)
        -> Result<(), BusError>;

    /// Durable conversation event keyed by session.
    async fn conversation_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: serde_json::Value,
        trace_id: &str,
    ) -> Result<(), BusError>;

    /// Durable analytics event.
    async fn analytics(
        &self,
        metric: &str,
        data: serde_json::Value,
        trace_id: &str,
    ) -> Result<(), BusError>;

    /// Durable audit entry keyed by user.
    async fn audit(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        data: serde_json::Value,
        trace_id: &str,
    ) -> Result<(), BusError>;
}

/// Production sink over both fabrics. Either side may be absent (degraded
/// startup); emission is then skipped for that fabric.
pub struct BusSessionSink {
    pub ephemeral: Option<Arc<EphemeralBus>>,
    pub durable: Option<Arc<DurableLog>>,
}

#[async_trait]
impl SessionSink for BusSessionSink {
    async fn session_started(
        &self,
        session: &SessionRecord,
        trace_id: &str,
    ) -> Result<(), BusError> {
        let Some(ref bus) = self.ephemeral else {
            return Ok(());
        };
        bus.publish(
            subjects::SESSION_STARTED,
            serde_json::json!({
                "user_id": session.user_id,
                "session_id": session.id,
                "room_id": session.room_id,
                "participant_id": session.participant_id,
                "agent_id": session.agent_id,
            }),
            Some(trace_id),
            Some("session_started"),
        )
        .await
    }

    async fn conversation_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: serde_json::Value,
        trace_id: &str,
    ) -> Result<(), BusError> {
        let Some(ref log) = self.durable else {
            return Ok(());
        };
        log.produce_conversation_event(session_id, event_type, data, Some(trace_id))
            .await
            .map(|_| ())
    }

    async fn analytics(
        &self,
        metric: &str,
        data: serde_json::Value,
        trace_id: &str,
    ) -> Result<(), BusError> {
        let Some(ref log) = self.durable else {
            return Ok(());
        };
        log.produce_analytics(metric, data, Some(trace_id))
            .await
            .map(|_| ())
    }

    async fn audit(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        data: serde_json::Value,
        trace_id: &str,
    ) -> Result<(), BusError> {
        let Some(ref log) = self.durable else {
            return Ok(());
        };
        log.produce_audit(user_id, action, resource, data, Some(trace_id))
            .await
            .map(|_| ())
    }
}

/// No-op sink for tests and broker-less development.
pub struct NullSessionSink;

#[async_trait]
impl SessionSink for NullSessionSink {
    async fn session_started(&self, _: &SessionRecord, _: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn conversation_event(
        &self,
        _: &str,
        _: &str,
        _: serde_json::Value,
        _: &str,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn analytics(&self, _: &str, _: serde_json::Value, _: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn audit(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: serde_json::Value,
        _: &str,
    ) -> Result<(), BusError> {
        Ok(())
    }
}
