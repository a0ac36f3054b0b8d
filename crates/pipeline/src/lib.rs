//! Voice pipeline wrappers
//!
//! The models themselves live behind narrow capability interfaces; this
//! crate owns voice-activity gating, turn boundaries, chunked synthesis,
//! concurrency caps and cancellation.

pub mod stt;
pub mod tts;
pub mod vad;

mod error;

pub use error::PipelineError;
pub use stt::{HttpSttBackend, ScriptedSttBackend, SttBackend, SttConfig, SttEvent, SttRecognizer};
pub use tts::{
    AudioChunk, HttpTtsBackend, SilenceTtsBackend, TtsBackend, TtsConfig, TtsStream,
    TtsSynthesizer,
};
pub use vad::{EnergyVad, VadConfig, VadEvent};
