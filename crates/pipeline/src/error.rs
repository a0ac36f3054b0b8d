//! Pipeline errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("TTS busy: concurrency cap reached")]
    TtsBusy,

    #[error("model not loaded")]
    ModelNotLoaded,

    #[error("audio error: {0}")]
    Audio(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stt(_) => "stt_error",
            Self::Tts(_) => "tts_error",
            Self::TtsBusy => "tts_busy",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::Audio(_) => "audio_error",
        }
    }
}
