//! STT recognizer wrapper
//!
//! Consumes audio frames through the VAD and emits turn-boundary events.
//! The final transcript is produced by a narrow backend capability after
//! voice end + hangover; an empty final means silence or noise and the
//! session returns to listening without reasoning.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;

use colloquy_core::AudioFrame;

use crate::vad::{EnergyVad, VadConfig, VadEvent};
use crate::PipelineError;

/// STT configuration.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub vad: VadConfig,
    pub sample_rate: u32,
    /// Emit interim transcripts while speech is in progress.
    pub interim_enabled: bool,
    /// Minimum buffered audio before an interim is attempted.
    pub interim_min_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            sample_rate: 16000,
            interim_enabled: false,
            interim_min_ms: 1000,
        }
    }
}

/// Recognition events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Voice activity started.
    VoiceStart,
    /// Interim transcript (optional, speech still in progress).
    Interim(String),
    /// Voice ended; hangover elapsed. The final transcript follows.
    VoiceEnd,
    /// Final transcript for the utterance. Empty text means the voiced
    /// segment carried no recognizable speech.
    Final { text: String, voiced_ms: u64 },
}

/// Transcription capability.
#[async_trait]
pub trait SttBackend: Send + Sync {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32)
        -> Result<String, PipelineError>;
}

/// Voice-gated recognizer.
pub struct SttRecognizer {
    backend: Arc<dyn SttBackend>,
    config: SttConfig,
    vad: EnergyVad,
    buffer: Vec<f32>,
    voice_start_ms: u64,
    last_interim_ms: u64,
}

impl SttRecognizer {
    pub fn new(backend: Arc<dyn SttBackend>, config: SttConfig) -> Self {
        let vad = EnergyVad::new(config.vad.clone());
        Self {
            backend,
            config,
            vad,
            buffer: Vec::new(),
            voice_start_ms: 0,
            last_interim_ms: 0,
        }
    }

    /// Feed one frame. At most one event is produced per frame; the final
    /// transcript is emitted as `Final` once the hangover has elapsed.
    pub async fn process(&mut self, frame: &AudioFrame) -> Result<Option<SttEvent>, PipelineError> {
        match self.vad.process(frame) {
            VadEvent::Silence => Ok(None),
            VadEvent::VoiceStart => {
                self.buffer.clear();
                self.buffer.extend_from_slice(&frame.samples);
                self.voice_start_ms = frame.timestamp_ms;
                self.last_interim_ms = frame.timestamp_ms;
                Ok(Some(SttEvent::VoiceStart))
            },
            VadEvent::VoiceContinue => {
                self.buffer.extend_from_slice(&frame.samples);
                if self.config.interim_enabled
                    && frame.timestamp_ms.saturating_sub(self.last_interim_ms)
                        >= self.config.interim_min_ms
                {
                    self.last_interim_ms = frame.timestamp_ms;
                    let text = self
                        .backend
                        .transcribe(&self.buffer, self.config.sample_rate)
                        .await?;
                    if !text.is_empty() {
                        return Ok(Some(SttEvent::Interim(text)));
                    }
                }
                Ok(None)
            },
            VadEvent::VoiceEnd => {
                let voiced_ms = self.vad.last_voice_ms().saturating_sub(self.voice_start_ms);
                let samples = std::mem::take(&mut self.buffer);
                let text = self
                    .backend
                    .transcribe(&samples, self.config.sample_rate)
                    .await?;
                Ok(Some(SttEvent::Final { text, voiced_ms }))
            },
        }
    }

    /// Whether speech is currently in progress.
    pub fn in_speech(&self) -> bool {
        self.vad.in_speech()
    }

    /// Timestamp of the end of the last voiced frame, for latency
    /// measurement (voice-end to final transcript).
    pub fn last_voice_ms(&self) -> u64 {
        self.vad.last_voice_ms()
    }

    /// Discard any pending utterance state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.vad.reset();
    }
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

/// HTTP transcription backend. Posts mono PCM as WAV to `/transcribe`.
pub struct HttpSttBackend {
    client: Client,
    endpoint: String,
}

impl HttpSttBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, PipelineError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| PipelineError::Audio(e.to_string()))?;
            for sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| PipelineError::Audio(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| PipelineError::Audio(e.to_string()))?;
        }
        Ok(cursor.into_inner())
    }
}

#[async_trait]
impl SttBackend for HttpSttBackend {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<String, PipelineError> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = Self::encode_wav(samples, sample_rate)?;
        let url = format!("{}/transcribe", self.endpoint);

        let response = self
            .client
            .post(&url)
            .header("content-type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| PipelineError::Stt(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Stt(format!(
                "transcription failed: {}",
                response.status()
            )));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Stt(format!("bad response: {}", e)))?;
        Ok(parsed.text.trim().to_string())
    }
}

/// Scripted backend for tests and broker-less development: pops one queued
/// transcript per finalized utterance.
#[derive(Default)]
pub struct ScriptedSttBackend {
    transcripts: Mutex<VecDeque<String>>,
}

impl ScriptedSttBackend {
    pub fn new(transcripts: Vec<String>) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.into()),
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        self.transcripts.lock().push_back(text.into());
    }
}

#[async_trait]
impl SttBackend for ScriptedSttBackend {
    async fn transcribe(
        &self,
        samples: &[f32],
        _sample_rate: u32,
    ) -> Result<String, PipelineError> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        Ok(self.transcripts.lock().pop_front().unwrap_or_default())
    }
}
