//! Observability helpers
//!
//! Thin wrappers over the `metrics` facade so every crate records the same
//! metric names and stage labels. Recording is infallible; instrumentation
//! never fails a turn.

/// Stage labels for `latency_ms{stage}` and per-stage spans.
pub mod stage {
    pub const STT: &str = "stt";
    pub const RETRIEVE_CONTEXT: &str = "retrieve_context";
    pub const LLM: &str = "llm";
    pub const PERSIST_TURN: &str = "persist_turn";
    pub const TTS: &str = "tts";
    pub const TURN: &str = "turn";
}

/// Record a stage latency sample.
pub fn record_stage_latency(stage: &'static str, ms: u64) {
    metrics::histogram!("latency_ms", "stage" => stage).record(ms as f64);
}

/// Count one request.
pub fn inc_requests() {
    metrics::counter!("requests_total").increment(1);
}

/// Count one error by kind.
pub fn inc_error(kind: &'static str) {
    metrics::counter!("errors_total", "kind" => kind).increment(1);
}

/// Record the number of context turns attached to a reasoning pass.
pub fn record_context_size(n: usize) {
    metrics::histogram!("context_size").record(n as f64);
}

/// Count a dropped audio frame.
pub fn inc_frames_dropped() {
    metrics::counter!("frames_dropped_total").increment(1);
}

/// Count a non-fatal context-retrieval failure.
pub fn inc_retrieval_warning() {
    metrics::counter!("retrieval_warnings_total").increment(1);
}
