//! Energy-based voice activity detection
//!
//! The VAD is authoritative for turn boundaries. Voice end is reported only
//! after the hangover has elapsed with no further activity, so brief pauses
//! inside an utterance do not split the turn.

use colloquy_core::AudioFrame;

/// VAD configuration.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS energy threshold for speech (0.0 - 1.0).
    pub energy_threshold: f32,
    /// Silence duration after the last voiced frame before voice end.
    pub hangover_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            hangover_ms: 400,
        }
    }
}

/// Per-frame VAD verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// No speech in progress.
    Silence,
    /// First voiced frame of an utterance.
    VoiceStart,
    /// Speech in progress (including the hangover window).
    VoiceContinue,
    /// Hangover elapsed after the last voiced frame.
    VoiceEnd,
}

/// Stateful energy VAD.
pub struct EnergyVad {
    config: VadConfig,
    in_speech: bool,
    last_voice_ms: u64,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            in_speech: false,
            last_voice_ms: 0,
        }
    }

    /// Classify one frame. Frames must arrive in timestamp order.
    pub fn process(&mut self, frame: &AudioFrame) -> VadEvent {
        let voiced = frame.energy() > self.config.energy_threshold;

        if voiced {
            self.last_voice_ms = frame.timestamp_ms + frame.duration_ms();
            if self.in_speech {
                VadEvent::VoiceContinue
            } else {
                self.in_speech = true;
                VadEvent::VoiceStart
            }
        } else if self.in_speech {
            let silent_for = frame
                .timestamp_ms
                .saturating_add(frame.duration_ms())
                .saturating_sub(self.last_voice_ms);
            if silent_for >= self.config.hangover_ms {
                self.in_speech = false;
                VadEvent::VoiceEnd
            } else {
                VadEvent::VoiceContinue
            }
        } else {
            VadEvent::Silence
        }
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Timestamp (ms) of the end of the last voiced frame.
    pub fn last_voice_ms(&self) -> u64 {
        self.last_voice_ms
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.last_voice_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voiced(ts: u64) -> AudioFrame {
        AudioFrame::new(vec![0.5; 320], 16000, ts)
    }

    fn silent(ts: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; 320], 16000, ts)
    }

    #[test]
    fn test_voice_start_and_continue() {
        let mut vad = EnergyVad::new(VadConfig::default());
        assert_eq!(vad.process(&silent(0)), VadEvent::Silence);
        assert_eq!(vad.process(&voiced(20)), VadEvent::VoiceStart);
        assert_eq!(vad.process(&voiced(40)), VadEvent::VoiceContinue);
    }

    #[test]
    fn test_hangover_delays_voice_end() {
        let mut vad = EnergyVad::new(VadConfig {
            energy_threshold: 0.01,
            hangover_ms: 400,
        });
        assert_eq!(vad.process(&voiced(0)), VadEvent::VoiceStart);
        // Silence inside the hangover window keeps the turn open
        assert_eq!(vad.process(&silent(100)), VadEvent::VoiceContinue);
        assert_eq!(vad.process(&silent(300)), VadEvent::VoiceContinue);
        // Past the hangover the turn closes
        assert_eq!(vad.process(&silent(420)), VadEvent::VoiceEnd);
        assert_eq!(vad.process(&silent(440)), VadEvent::Silence);
    }

    #[test]
    fn test_speech_resumes_within_hangover() {
        let mut vad = EnergyVad::new(VadConfig::default());
        vad.process(&voiced(0));
        vad.process(&silent(100));
        // New speech before the hangover elapses continues the same turn
        assert_eq!(vad.process(&voiced(200)), VadEvent::VoiceContinue);
        assert!(vad.in_speech());
    }

    #[test]
    fn test_reset() {
        let mut vad = EnergyVad::new(VadConfig::default());
        vad.process(&voiced(0));
        vad.reset();
        assert!(!vad.in_speech());
        assert_eq!(vad.process(&voiced(20)), VadEvent::VoiceStart);
    }
}
