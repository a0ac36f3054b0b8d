//! HTTP Endpoints
//!
//! Test/debug REST surface for the voice agent: direct chat into the
//! reasoning engine, one-shot synthesis, health and metrics.

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use colloquy_pipeline::PipelineError;
use colloquy_reason::TurnRequest;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::ws;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/chat", post(chat))
        .route("/tts", post(tts))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/ws/:user_id", get(ws::ws_handler));

    if state.settings.server.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    user_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    user_id: String,
    text: String,
    latency_ms: u64,
}

/// POST /chat: invoke one reasoning turn directly.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<serde_json::Value>)> {
    if request.user_id.is_empty() || request.text.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "user_id and text must be non-empty",
        ));
    }

    let Some(ref reasoner) = state.reasoner else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "reasoning engine not ready",
        ));
    };

    let outcome = reasoner
        .run_turn(TurnRequest {
            turn_index: state.next_chat_turn(&request.user_id),
            user_id: request.user_id.clone(),
            session_id: None,
            room_id: None,
            utterance: request.text,
            history: Vec::new(),
            latency_stt_ms: 0,
            trace_id: Uuid::new_v4().to_string(),
            timeout: None,
        })
        .await;

    if outcome.reasoning_degraded {
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reasoning failed",
        ));
    }

    Ok(Json(ChatResponse {
        user_id: request.user_id,
        text: outcome.reply,
        latency_ms: outcome.latency_ms,
    }))
}

#[derive(Debug, Deserialize)]
struct TtsRequest {
    text: String,
}

/// POST /tts: synthesize one utterance and return it as WAV.
async fn tts(
    State(state): State<AppState>,
    Json(request): Json<TtsRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if request.text.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "text must be non-empty"));
    }
    if !state.tts.is_loaded() {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "TTS model not loaded",
        ));
    }

    let mut stream = state.tts.synthesize(&request.text).await.map_err(|e| {
        let status = match e {
            PipelineError::TtsBusy | PipelineError::ModelNotLoaded => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, &e.to_string())
    })?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate = state.tts.sample_rate();
    while let Some(chunk) = stream.next_chunk().await {
        let chunk = chunk.map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        })?;
        sample_rate = chunk.sample_rate;
        samples.extend_from_slice(&chunk.samples);
    }

    let wav = encode_wav(&samples, sample_rate)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e))?;

    Ok(([(header::CONTENT_TYPE, "audio/wav")], wav))
}

/// GET /health: always 200; the body reflects component state.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match state.memory {
        Some(ref memory) => memory.health().await,
        None => false,
    };
    let bus = state
        .ephemeral
        .as_ref()
        .map(|bus| bus.is_connected())
        .unwrap_or(false);
    let model_loaded = state.tts.is_loaded();

    let status = if database && bus && model_loaded {
        "healthy"
    } else {
        "degraded"
    };

    Json(serde_json::json!({
        "status": status,
        "database": database,
        "bus": bus,
        "model_loaded": model_loaded,
        "active_sessions": state.sessions.count(),
        "uptime_s": state.uptime_s(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(|e| e.to_string())?;
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(value).map_err(|e| e.to_string())?;
        }
        writer.finalize().map_err(|e| e.to_string())?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_wav_header() {
        let wav = encode_wav(&[0.0, 0.25, -0.25], 22_050).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
