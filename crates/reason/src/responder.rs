//! Brain responder
//!
//! Serves `agent.brain.request` on the ephemeral bus: parse the request,
//! run one reasoning turn, reply with `{text, latency_ms}` or an error
//! envelope. A queue group makes replicas competing consumers.

use std::sync::Arc;
use std::time::Duration;

use colloquy_bus::{BusError, EphemeralBus};
use colloquy_core::{subjects, BrainReply, BrainRequest};

use crate::workflow::{Reasoner, TurnRequest};

/// Subscribe the reasoner to `agent.brain.request`.
pub async fn serve_brain_requests(
    bus: &EphemeralBus,
    reasoner: Arc<Reasoner>,
    queue: Option<&str>,
) -> Result<(), BusError> {
    bus.subscribe(subjects::BRAIN_REQUEST, queue, move |envelope| {
        let reasoner = reasoner.clone();
        async move {
            let request: BrainRequest = envelope
                .payload_as()
                .map_err(|e| BusError::MalformedMessage(e.to_string()))?;

            tracing::debug!(
                request_id = %request.request_id,
                user_id = %request.user_id,
                turn_index = request.turn_index,
                "Handling brain request"
            );

            let outcome = reasoner
                .run_turn(TurnRequest {
                    user_id: request.user_id,
                    session_id: Some(request.session_id),
                    room_id: None,
                    turn_index: request.turn_index,
                    utterance: request.user_utterance,
                    history: Vec::new(),
                    latency_stt_ms: request.latency_stt_ms,
                    trace_id: envelope.trace_id.clone(),
                    timeout: Some(Duration::from_millis(request.constraints.timeout_ms)),
                })
                .await;

            let reply = BrainReply {
                text: outcome.reply,
                latency_ms: outcome.latency_ms,
                turn_index: outcome.turn_index,
                reasoning_degraded: outcome.reasoning_degraded,
            };
            Ok(Some(serde_json::to_value(reply).unwrap_or_default()))
        }
    })
    .await
}
