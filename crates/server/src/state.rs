//! Application State
//!
//! Shared state across all handlers. Components are optional where startup
//! may proceed degraded (missing broker, missing store); the health
//! endpoint reflects what is actually wired.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;

use colloquy_bus::{BusError, DurableLog, EphemeralBus};
use colloquy_config::Settings;
use colloquy_core::{BrainReply, BrainRequest};
use colloquy_memory::TurnMemory;
use colloquy_pipeline::TtsSynthesizer;
use colloquy_reason::{Reasoner, TurnRequest};
use colloquy_session::{BrainClient, SessionManager};

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    /// In-process reasoning engine; absent when memory is unavailable.
    pub reasoner: Option<Arc<Reasoner>>,
    pub memory: Option<Arc<TurnMemory>>,
    pub tts: Arc<TtsSynthesizer>,
    pub sessions: Arc<SessionManager>,
    pub ephemeral: Option<Arc<EphemeralBus>>,
    pub durable: Option<Arc<DurableLog>>,
    pub metrics: PrometheusHandle,
    /// Per-user turn counters for the debug chat surface.
    chat_turns: Arc<DashMap<String, u32>>,
    started_at: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        reasoner: Option<Arc<Reasoner>>,
        memory: Option<Arc<TurnMemory>>,
        tts: Arc<TtsSynthesizer>,
        sessions: Arc<SessionManager>,
        ephemeral: Option<Arc<EphemeralBus>>,
        durable: Option<Arc<DurableLog>>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            reasoner,
            memory,
            tts,
            sessions,
            ephemeral,
            durable,
            metrics,
            chat_turns: Arc::new(DashMap::new()),
            started_at: std::time::Instant::now(),
        }
    }

    /// Next debug-chat turn index for a user. Collisions with live voice
    /// sessions are resolved by the workflow's duplicate handling.
    pub fn next_chat_turn(&self, user_id: &str) -> u32 {
        let mut entry = self.chat_turns.entry(user_id.to_string()).or_insert(0);
        let index = *entry;
        *entry += 1;
        index
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// In-process brain client used when no ephemeral bus is configured: the
/// session manager calls the reasoner directly instead of dispatching
/// `agent.brain.request`.
pub struct LocalBrain {
    reasoner: Arc<Reasoner>,
}

impl LocalBrain {
    pub fn new(reasoner: Arc<Reasoner>) -> Self {
        Self { reasoner }
    }
}

#[async_trait]
impl BrainClient for LocalBrain {
    async fn reason(
        &self,
        request: BrainRequest,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<BrainReply, BusError> {
        let outcome = tokio::time::timeout(
            timeout,
            self.reasoner.run_turn(TurnRequest {
                user_id: request.user_id,
                session_id: Some(request.session_id),
                room_id: None,
                turn_index: request.turn_index,
                utterance: request.user_utterance,
                history: Vec::new(),
                latency_stt_ms: request.latency_stt_ms,
                trace_id: trace_id.to_string(),
                timeout: Some(Duration::from_millis(request.constraints.timeout_ms)),
            }),
        )
        .await
        .map_err(|_| BusError::Timeout)?;

        Ok(BrainReply {
            text: outcome.reply,
            latency_ms: outcome.latency_ms,
            turn_index: outcome.turn_index,
            reasoning_degraded: outcome.reasoning_degraded,
        })
    }
}
