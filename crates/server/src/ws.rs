//! WebSocket voice ingress (debug transport)
//!
//! Binary frames carry little-endian 16-bit mono PCM at 16 kHz in both
//! directions. Session events of interest are forwarded as JSON text
//! frames. The production media transport is out of core; this endpoint
//! exists to drive the full pipeline end to end.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};

use colloquy_core::AudioFrame;
use colloquy_session::SessionEvent;

use crate::state::AppState;

const SAMPLE_RATE: u32 = 16_000;

/// GET /ws/{user_id}
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handle = state.sessions.open_session(user_id.clone(), None, None);
    handle.track_subscribed().await;
    let mut events = handle.subscribe();

    if let Some(ref bus) = state.ephemeral {
        let _ = bus
            .publish(
                colloquy_core::subjects::TRACK_PUBLISHED,
                serde_json::json!({
                    "room_id": serde_json::Value::Null,
                    "participant_id": user_id,
                    "track_id": handle.session_id(),
                    "track_kind": "audio",
                }),
                None,
                Some("track_published"),
            )
            .await;
    }

    // Session events -> client
    let forwarder = {
        let session_id = handle.session_id().to_string();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let message = match event {
                    SessionEvent::AudioChunk { samples, .. } => {
                        Message::Binary(pcm_to_bytes(&samples))
                    },
                    SessionEvent::FinalTranscript { text } => Message::Text(
                        serde_json::json!({ "type": "transcript", "text": text }).to_string(),
                    ),
                    SessionEvent::Speaking { text } => Message::Text(
                        serde_json::json!({ "type": "speaking", "text": text }).to_string(),
                    ),
                    SessionEvent::BargeIn => {
                        Message::Text(serde_json::json!({ "type": "barge_in" }).to_string())
                    },
                    SessionEvent::TurnTimeout => {
                        Message::Text(serde_json::json!({ "type": "turn_timeout" }).to_string())
                    },
                    SessionEvent::Closed { status } => {
                        let _ = ws_tx
                            .send(Message::Text(
                                serde_json::json!({
                                    "type": "closed",
                                    "status": status.as_str(),
                                })
                                .to_string(),
                            ))
                            .await;
                        break;
                    },
                    _ => continue,
                };
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!(session_id = %session_id, "WS event forwarder finished");
        })
    };

    // Client audio -> session
    let mut timestamp_ms: u64 = 0;
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Binary(bytes)) => {
                let samples = bytes_to_pcm(&bytes);
                if samples.is_empty() {
                    continue;
                }
                let frame = AudioFrame::new(samples, SAMPLE_RATE, timestamp_ms);
                timestamp_ms += frame.duration_ms();
                handle.push_frame(frame);
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {},
        }
    }

    handle.leave("websocket disconnected").await;
    handle.join().await;
    state.sessions.remove(handle.session_id());
    forwarder.abort();
    tracing::info!(user_id = %user_id, "WS voice session finished");
}

fn pcm_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn bytes_to_pcm(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_round_trip() {
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let bytes = pcm_to_bytes(&samples);
        let decoded = bytes_to_pcm(&bytes);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_odd_byte_tail_ignored() {
        let decoded = bytes_to_pcm(&[0, 0, 7]);
        assert_eq!(decoded.len(), 1);
    }
}
