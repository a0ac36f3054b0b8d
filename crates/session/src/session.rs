//! Voice session state machine
//!
//! ```text
//! idle → listening → transcribing → reasoning → speaking → listening
//!                         ▲              │           │
//!                         └── barge-in ──┴───────────┘
//! ```
//!
//! One cooperative task per session advances the machine; no other task
//! mutates session state. Audio frames arrive through a bounded drop-oldest
//! queue, control events through a channel. Sub-operations (STT, reasoning,
//! TTS) are awaited with cancellation: dropping the in-flight future is the
//! cancellation, and it can only happen at an await point, so persisted
//! state is never left half-written.

use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use colloquy_bus::BusError;
use colloquy_core::{
    observe, AudioFrame, BrainConstraints, BrainReply, BrainRequest, SessionRecord, SessionStatus,
    TurnLatency,
};
use colloquy_memory::SessionStore;
use colloquy_pipeline::{
    AudioChunk, PipelineError, SttBackend, SttConfig, SttEvent, SttRecognizer, TtsSynthesizer,
};
use colloquy_reason::FALLBACK_REPLY;

use crate::queue::FrameQueue;
use crate::stats::TurnStats;
use crate::{BrainClient, SessionSink};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Transcribing,
    Reasoning,
    Speaking,
    Closing,
    Closed,
}

/// External control stimuli.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Participant audio track subscribed; start listening.
    TrackSubscribed,
    /// Participant left.
    Leave { reason: String },
    /// Abort the session.
    Cancel,
}

/// Events broadcast to session observers (transport bridges, tests).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    PartialTranscript {
        text: String,
    },
    FinalTranscript {
        text: String,
    },
    Speaking {
        text: String,
    },
    AudioChunk {
        samples: Arc<[f32]>,
        sample_rate: u32,
        is_final: bool,
    },
    BargeIn,
    TurnCompleted {
        turn_index: u32,
        latency: TurnLatency,
        reasoning_degraded: bool,
    },
    TurnTimeout,
    SttFailed,
    Closed {
        status: SessionStatus,
    },
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct VoiceSessionConfig {
    pub user_id: String,
    pub agent_id: String,
    pub room_id: Option<String>,
    pub participant_id: Option<String>,
    /// Audio input queue capacity (drop-oldest on overflow).
    pub queue_capacity: usize,
    /// End-to-end deadline per turn, final transcript to first audio chunk.
    pub turn_deadline: Duration,
    /// Reasoning deadline forwarded to the brain.
    pub reason_deadline: Duration,
    /// Deadline for any single STT operation.
    pub stt_deadline: Duration,
    /// Deadline for the first TTS chunk after the reply is ready.
    pub tts_first_chunk_deadline: Duration,
    /// Bus round-trip margin on top of the reasoning deadline.
    pub request_margin: Duration,
    /// Consecutive STT failures before the session ends with an error.
    pub max_stt_failures: u32,
    /// No frames and no turns for this long finalizes the session.
    pub idle_timeout: Duration,
}

impl Default for VoiceSessionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            agent_id: "colloquy-voice".to_string(),
            room_id: None,
            participant_id: None,
            queue_capacity: 128,
            turn_deadline: Duration::from_secs(7),
            reason_deadline: Duration::from_secs(5),
            stt_deadline: Duration::from_secs(3),
            tts_first_chunk_deadline: Duration::from_secs(1),
            request_margin: Duration::from_millis(500),
            max_stt_failures: 3,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Shared collaborators injected into each session.
#[derive(Clone)]
pub struct SessionDeps {
    pub brain: Arc<dyn BrainClient>,
    pub tts: Arc<TtsSynthesizer>,
    pub stt_backend: Arc<dyn SttBackend>,
    pub stt_config: SttConfig,
    pub sink: Arc<dyn SessionSink>,
    pub store: Arc<dyn SessionStore>,
}

/// Handle to a running session task.
pub struct VoiceSessionHandle {
    session_id: String,
    user_id: String,
    frames: Arc<FrameQueue>,
    control_tx: mpsc::Sender<ControlEvent>,
    events_tx: broadcast::Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    task: Mutex<Option<JoinHandle<SessionStatus>>>,
    abort: tokio::task::AbortHandle,
}

impl VoiceSessionHandle {
    /// Deliver an audio frame. Never blocks; overflow drops the oldest
    /// frame and bumps the `frames_dropped` counter.
    pub fn push_frame(&self, frame: AudioFrame) {
        self.frames.push(frame);
    }

    pub async fn track_subscribed(&self) {
        let _ = self.control_tx.send(ControlEvent::TrackSubscribed).await;
    }

    pub async fn leave(&self, reason: impl Into<String>) {
        let _ = self
            .control_tx
            .send(ControlEvent::Leave {
                reason: reason.into(),
            })
            .await;
    }

    pub async fn cancel(&self) {
        let _ = self.control_tx.send(ControlEvent::Cancel).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames.dropped()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closed)
    }

    /// Wait for the session task to finish and return the final status.
    /// Returns `None` when already joined.
    pub async fn join(&self) -> Option<SessionStatus> {
        let task = self.task.lock().take()?;
        task.await.ok()
    }

    /// Abort the task outright. Used by the manager after the drain
    /// deadline.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

/// Factory for session tasks.
pub struct VoiceSession;

impl VoiceSession {
    /// Spawn the session task and return its handle.
    pub fn spawn(config: VoiceSessionConfig, deps: SessionDeps) -> Arc<VoiceSessionHandle> {
        let session_id = Uuid::new_v4().to_string();
        let frames = Arc::new(FrameQueue::new(config.queue_capacity));
        let (control_tx, control_rx) = mpsc::channel(16);
        let (events_tx, _) = broadcast::channel(256);
        let state = Arc::new(RwLock::new(SessionState::Idle));

        let record = SessionRecord::open(
            session_id.clone(),
            config.user_id.clone(),
            config.agent_id.clone(),
            config.room_id.clone(),
            config.participant_id.clone(),
        );

        let stt = SttRecognizer::new(deps.stt_backend.clone(), deps.stt_config.clone());

        let task = SessionTask {
            config: config.clone(),
            deps,
            frames: frames.clone(),
            control_rx,
            events_tx: events_tx.clone(),
            state: state.clone(),
            stt,
            record,
            stats: TurnStats::new(),
            turn_index: 0,
            stt_failures: 0,
            last_activity: tokio::time::Instant::now(),
        };

        let join = tokio::spawn(task.run());
        let abort = join.abort_handle();

        Arc::new(VoiceSessionHandle {
            session_id,
            user_id: config.user_id,
            frames,
            control_tx,
            events_tx,
            state,
            task: Mutex::new(Some(join)),
            abort,
        })
    }
}

enum FrameOutcome {
    None,
    TurnReady { text: String, stt_ms: u32 },
    Fatal,
}

enum TurnExit {
    Continue,
    Close(SessionStatus),
}

struct SessionTask {
    config: VoiceSessionConfig,
    deps: SessionDeps,
    frames: Arc<FrameQueue>,
    control_rx: mpsc::Receiver<ControlEvent>,
    events_tx: broadcast::Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    stt: SttRecognizer,
    record: SessionRecord,
    stats: TurnStats,
    turn_index: u32,
    stt_failures: u32,
    last_activity: tokio::time::Instant,
}

impl SessionTask {
    async fn run(mut self) -> SessionStatus {
        let trace_id = Uuid::new_v4().to_string();
        tracing::info!(
            session_id = %self.record.id,
            user_id = %self.record.user_id,
            "Voice session starting"
        );

        if let Err(e) = self.deps.store.upsert(&self.record).await {
            tracing::warn!(session_id = %self.record.id, error = %e, "Initial session upsert failed");
        }
        if let Err(e) = self.deps.sink.session_started(&self.record, &trace_id).await {
            tracing::warn!(session_id = %self.record.id, error = %e, "Session announce failed");
        }
        let _ = self
            .deps
            .sink
            .audit(
                &self.record.user_id.clone(),
                "session_started",
                "session",
                serde_json::json!({ "session_id": self.record.id }),
                &trace_id,
            )
            .await;

        let status = self.serve().await;
        self.close(status).await;
        status
    }

    async fn serve(&mut self) -> SessionStatus {
        enum Step {
            Control(Option<ControlEvent>),
            Frame(AudioFrame),
            IdleTimeout,
        }

        loop {
            let receiving = matches!(
                self.state_snapshot(),
                SessionState::Listening | SessionState::Transcribing
            );
            let idle_deadline = self.last_activity + self.config.idle_timeout;

            let step = {
                let frames = self.frames.clone();
                tokio::select! {
                    maybe = self.control_rx.recv() => Step::Control(maybe),
                    frame = frames.pop(), if receiving => Step::Frame(frame),
                    _ = tokio::time::sleep_until(idle_deadline) => Step::IdleTimeout,
                }
            };

            match step {
                Step::IdleTimeout => {
                    tracing::info!(session_id = %self.record.id, "Session idle timeout");
                    return SessionStatus::Ended;
                },
                Step::Control(None) => return SessionStatus::Ended,
                Step::Control(Some(ControlEvent::TrackSubscribed)) => {
                    if self.state_snapshot() == SessionState::Idle {
                        self.set_state(SessionState::Listening);
                    }
                },
                Step::Control(Some(ControlEvent::Leave { reason })) => {
                    tracing::info!(session_id = %self.record.id, reason = %reason, "Participant left");
                    return SessionStatus::Ended;
                },
                Step::Control(Some(ControlEvent::Cancel)) => return SessionStatus::Ended,
                Step::Frame(frame) => {
                    self.last_activity = tokio::time::Instant::now();
                    match self.feed_frame(frame).await {
                        FrameOutcome::None => {},
                        FrameOutcome::Fatal => return SessionStatus::Error,
                        FrameOutcome::TurnReady { text, stt_ms } => {
                            match self.run_turn(text, stt_ms).await {
                                TurnExit::Continue => {},
                                TurnExit::Close(status) => return status,
                            }
                        },
                    }
                },
            }
        }
    }

    /// Advance STT with one frame while listening/transcribing.
    async fn feed_frame(&mut self, frame: AudioFrame) -> FrameOutcome {
        let started = Instant::now();
        let result =
            tokio::time::timeout(self.config.stt_deadline, self.stt.process(&frame)).await;

        let event = match result {
            Err(_) => return self.stt_failure("stt deadline exceeded"),
            Ok(Err(e)) => return self.stt_failure(&e.to_string()),
            Ok(Ok(event)) => event,
        };

        match event {
            None => FrameOutcome::None,
            Some(SttEvent::VoiceStart) => {
                if self.state_snapshot() == SessionState::Listening {
                    self.set_state(SessionState::Transcribing);
                }
                FrameOutcome::None
            },
            Some(SttEvent::Interim(text)) => {
                let _ = self.events_tx.send(SessionEvent::PartialTranscript { text });
                FrameOutcome::None
            },
            Some(SttEvent::VoiceEnd) => FrameOutcome::None,
            Some(SttEvent::Final { text, .. }) => {
                self.stt_failures = 0;
                if text.is_empty() {
                    // Silence or noise: back to listening without reasoning
                    self.set_state(SessionState::Listening);
                    return FrameOutcome::None;
                }
                let stt_ms = started.elapsed().as_millis() as u32;
                observe::record_stage_latency(observe::stage::STT, stt_ms as u64);
                let _ = self.events_tx.send(SessionEvent::FinalTranscript {
                    text: text.clone(),
                });
                FrameOutcome::TurnReady { text, stt_ms }
            },
        }
    }

    fn stt_failure(&mut self, error: &str) -> FrameOutcome {
        self.stt_failures += 1;
        observe::inc_error("stt_failed");
        tracing::warn!(
            session_id = %self.record.id,
            failures = self.stt_failures,
            error = %error,
            "STT failure"
        );
        let _ = self.events_tx.send(SessionEvent::SttFailed);
        self.stt.reset();
        self.set_state(SessionState::Listening);

        if self.stt_failures >= self.config.max_stt_failures {
            tracing::error!(session_id = %self.record.id, "Consecutive STT failures, ending session");
            FrameOutcome::Fatal
        } else {
            FrameOutcome::None
        }
    }

    /// Execute one turn: reasoning then speaking, with barge-in, leave and
    /// deadline monitoring throughout.
    async fn run_turn(&mut self, text: String, stt_ms: u32) -> TurnExit {
        observe::inc_requests();
        let turn_start = Instant::now();
        let turn_deadline = tokio::time::Instant::now() + self.config.turn_deadline;
        let trace_id = Uuid::new_v4().to_string();

        self.set_state(SessionState::Reasoning);

        let request = BrainRequest {
            request_id: Uuid::new_v4().to_string(),
            user_id: self.record.user_id.clone(),
            session_id: self.record.id.clone(),
            conversation_id: self.record.id.clone(),
            turn_index: self.turn_index,
            user_utterance: text,
            context: Vec::new(),
            constraints: BrainConstraints {
                timeout_ms: self.config.reason_deadline.as_millis() as u64,
                ..Default::default()
            },
            latency_stt_ms: stt_ms,
        };

        let brain = self.deps.brain.clone();
        let call_timeout = self.config.reason_deadline + self.config.request_margin;
        let call_trace = trace_id.clone();
        let mut reason_call =
            pin!(async move { brain.reason(request, call_timeout, &call_trace).await });

        enum ReasonStep {
            Reply(Result<BrainReply, BusError>),
            Frame(AudioFrame),
            Control(Option<ControlEvent>),
            Deadline,
        }

        let reason_started = Instant::now();
        let reply = loop {
            let step = {
                let frames = self.frames.clone();
                tokio::select! {
                    result = &mut reason_call => ReasonStep::Reply(result),
                    frame = frames.pop() => ReasonStep::Frame(frame),
                    maybe = self.control_rx.recv() => ReasonStep::Control(maybe),
                    _ = tokio::time::sleep_until(turn_deadline) => ReasonStep::Deadline,
                }
            };

            match step {
                ReasonStep::Reply(result) => break result,
                ReasonStep::Frame(frame) => {
                    if self.voice_during_turn(frame).await {
                        // Dropping the pinned call cancels the in-flight
                        // reasoning; its result is discarded
                        self.barge_in(&trace_id).await;
                        return TurnExit::Continue;
                    }
                },
                ReasonStep::Control(ctrl) => match ctrl {
                    None | Some(ControlEvent::Leave { .. }) | Some(ControlEvent::Cancel) => {
                        return TurnExit::Close(SessionStatus::Ended);
                    },
                    Some(ControlEvent::TrackSubscribed) => {},
                },
                ReasonStep::Deadline => {
                    self.turn_timeout(&trace_id).await;
                    return TurnExit::Continue;
                },
            }
        };
        let reason_ms = reason_started.elapsed().as_millis() as u32;

        let (reply_text, degraded, reply_index) = match reply {
            Ok(reply) => {
                // Reconcile the index counter past whatever the brain
                // actually persisted under
                self.turn_index = reply.turn_index.max(self.turn_index) + 1;
                (reply.text, reply.reasoning_degraded, reply.turn_index)
            },
            Err(e) => {
                // Timeout and remote errors degrade to the fixed apology;
                // the fallback IS spoken and the session stays live
                observe::inc_error(e.kind());
                tracing::warn!(
                    session_id = %self.record.id,
                    error = %e,
                    "Reasoning unavailable, speaking fallback"
                );
                let index = self.turn_index;
                self.turn_index += 1;
                (FALLBACK_REPLY.to_string(), true, index)
            },
        };

        self.speak(
            reply_text,
            degraded,
            reply_index,
            stt_ms,
            reason_ms,
            turn_start,
            turn_deadline,
            &trace_id,
        )
        .await
    }

    /// Speaking phase: stream TTS chunks while watching for barge-in,
    /// leave, and the first-chunk deadline.
    #[allow(clippy::too_many_arguments)]
    async fn speak(
        &mut self,
        reply_text: String,
        degraded: bool,
        turn_index: u32,
        stt_ms: u32,
        reason_ms: u32,
        turn_start: Instant,
        turn_deadline: tokio::time::Instant,
        trace_id: &str,
    ) -> TurnExit {
        self.set_state(SessionState::Speaking);
        let _ = self.events_tx.send(SessionEvent::Speaking {
            text: reply_text.clone(),
        });

        let mut stream = match self.deps.tts.synthesize(&reply_text).await {
            Ok(stream) => stream,
            Err(PipelineError::TtsBusy) => {
                // Backpressure: the spoken reply is dropped, next turn
                // begins fresh
                observe::inc_error("tts_busy");
                tracing::warn!(session_id = %self.record.id, "TTS busy, dropping spoken reply");
                self.set_state(SessionState::Listening);
                return TurnExit::Continue;
            },
            Err(e) => {
                observe::inc_error(e.kind());
                tracing::error!(session_id = %self.record.id, error = %e, "TTS failed");
                self.set_state(SessionState::Listening);
                return TurnExit::Continue;
            },
        };

        let reply_ready = Instant::now();
        let first_chunk_deadline =
            (reply_ready + self.config.tts_first_chunk_deadline).min(turn_deadline.into_std());
        let first_chunk_deadline = tokio::time::Instant::from_std(first_chunk_deadline);
        let mut got_first_chunk = false;

        enum SpeakStep {
            Chunk(Option<Result<AudioChunk, PipelineError>>),
            Frame(AudioFrame),
            Control(Option<ControlEvent>),
            Deadline,
        }

        loop {
            let step = {
                let frames = self.frames.clone();
                tokio::select! {
                    chunk = stream.next_chunk() => SpeakStep::Chunk(chunk),
                    frame = frames.pop() => SpeakStep::Frame(frame),
                    maybe = self.control_rx.recv() => SpeakStep::Control(maybe),
                    _ = tokio::time::sleep_until(first_chunk_deadline), if !got_first_chunk => SpeakStep::Deadline,
                }
            };

            match step {
                SpeakStep::Chunk(None) => {
                    // Stream complete
                    self.set_state(SessionState::Listening);
                    return TurnExit::Continue;
                },
                SpeakStep::Chunk(Some(Ok(chunk))) => {
                    if !got_first_chunk {
                        got_first_chunk = true;
                        let latency = TurnLatency {
                            stt_ms,
                            reason_ms,
                            tts_ms: reply_ready.elapsed().as_millis() as u32,
                            total_ms: stt_ms + turn_start.elapsed().as_millis() as u32,
                        };
                        self.complete_turn(latency, degraded, turn_index, trace_id)
                            .await;
                    }
                    let _ = self.events_tx.send(SessionEvent::AudioChunk {
                        samples: chunk.samples,
                        sample_rate: chunk.sample_rate,
                        is_final: chunk.is_final,
                    });
                },
                SpeakStep::Chunk(Some(Err(e))) => {
                    observe::inc_error(e.kind());
                    tracing::error!(session_id = %self.record.id, error = %e, "TTS stream failed");
                    self.set_state(SessionState::Listening);
                    return TurnExit::Continue;
                },
                SpeakStep::Frame(frame) => {
                    if self.voice_during_turn(frame).await {
                        // Cancel at the next chunk boundary; audio already
                        // dispatched is not rolled back
                        drop(stream);
                        self.barge_in(trace_id).await;
                        return TurnExit::Continue;
                    }
                },
                SpeakStep::Control(ctrl) => match ctrl {
                    None | Some(ControlEvent::Leave { .. }) | Some(ControlEvent::Cancel) => {
                        return TurnExit::Close(SessionStatus::Ended);
                    },
                    Some(ControlEvent::TrackSubscribed) => {},
                },
                SpeakStep::Deadline => {
                    drop(stream);
                    self.turn_timeout(trace_id).await;
                    return TurnExit::Continue;
                },
            }
        }
    }

    /// Feed a frame to STT while reasoning/speaking; returns true when it
    /// opens a new utterance (barge-in).
    async fn voice_during_turn(&mut self, frame: AudioFrame) -> bool {
        match tokio::time::timeout(self.config.stt_deadline, self.stt.process(&frame)).await {
            Ok(Ok(Some(SttEvent::VoiceStart))) => true,
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                tracing::debug!(session_id = %self.record.id, error = %e, "STT error during turn");
                false
            },
            Err(_) => false,
        }
    }

    async fn barge_in(&mut self, trace_id: &str) {
        tracing::info!(session_id = %self.record.id, "Barge-in detected");
        metrics::counter!("barge_in_total").increment(1);
        let _ = self.events_tx.send(SessionEvent::BargeIn);
        self.set_state(SessionState::Transcribing);

        if let Err(e) = self
            .deps
            .sink
            .conversation_event(
                &self.record.id.clone(),
                "barge_in",
                serde_json::json!({
                    "session_id": self.record.id,
                    "user_id": self.record.user_id,
                }),
                trace_id,
            )
            .await
        {
            tracing::warn!(session_id = %self.record.id, error = %e, "Failed to emit barge_in event");
        }
    }

    async fn turn_timeout(&mut self, trace_id: &str) {
        tracing::warn!(session_id = %self.record.id, "Turn deadline elapsed with no audio");
        observe::inc_error("turn_timeout");
        let _ = self.events_tx.send(SessionEvent::TurnTimeout);
        self.set_state(SessionState::Listening);

        if let Err(e) = self
            .deps
            .sink
            .conversation_event(
                &self.record.id.clone(),
                "turn_timeout",
                serde_json::json!({
                    "session_id": self.record.id,
                    "user_id": self.record.user_id,
                    "turn_index": self.turn_index,
                }),
                trace_id,
            )
            .await
        {
            tracing::warn!(session_id = %self.record.id, error = %e, "Failed to emit turn_timeout event");
        }
    }

    /// Record metrics and aggregates once the first audio chunk is out.
    async fn complete_turn(
        &mut self,
        latency: TurnLatency,
        degraded: bool,
        turn_index: u32,
        trace_id: &str,
    ) {
        observe::record_stage_latency(observe::stage::TTS, latency.tts_ms as u64);
        observe::record_stage_latency(observe::stage::TURN, latency.total_ms as u64);

        self.stats.record(&latency);
        self.stats.apply(&mut self.record);
        if let Err(e) = self.deps.store.upsert(&self.record).await {
            tracing::warn!(session_id = %self.record.id, error = %e, "Session aggregate upsert failed");
        }

        let _ = self.events_tx.send(SessionEvent::TurnCompleted {
            turn_index,
            latency,
            reasoning_degraded: degraded,
        });

        if let Err(e) = self
            .deps
            .sink
            .analytics(
                "latency-metrics",
                serde_json::json!({
                    "operation": "voice_turn",
                    "session_id": self.record.id,
                    "turn_index": turn_index,
                    "latency_ms": latency.total_ms,
                    "latency_stt_ms": latency.stt_ms,
                    "latency_reason_ms": latency.reason_ms,
                    "latency_tts_ms": latency.tts_ms,
                    "reasoning_degraded": degraded,
                }),
                trace_id,
            )
            .await
        {
            tracing::debug!(session_id = %self.record.id, error = %e, "Failed to emit latency analytics");
        }

        tracing::info!(
            session_id = %self.record.id,
            turn_index = turn_index,
            total_ms = latency.total_ms,
            degraded = degraded,
            "Turn completed"
        );
    }

    async fn close(&mut self, status: SessionStatus) {
        self.set_state(SessionState::Closing);
        let trace_id = Uuid::new_v4().to_string();

        self.stats.apply(&mut self.record);
        if !self.record.finalize(status) {
            tracing::warn!(session_id = %self.record.id, "Session already finalized");
        }
        if let Err(e) = self.deps.store.upsert(&self.record).await {
            tracing::warn!(session_id = %self.record.id, error = %e, "Final session upsert failed");
        }

        if let Err(e) = self
            .deps
            .sink
            .conversation_event(
                &self.record.id.clone(),
                "session_ended",
                serde_json::json!({
                    "session_id": self.record.id,
                    "user_id": self.record.user_id,
                    "status": status.as_str(),
                    "total_turns": self.record.total_turns,
                    "duration_s": self.record.duration_s,
                    "frames_dropped": self.frames.dropped(),
                }),
                &trace_id,
            )
            .await
        {
            tracing::warn!(session_id = %self.record.id, error = %e, "Failed to emit session_ended event");
        }
        let _ = self
            .deps
            .sink
            .audit(
                &self.record.user_id.clone(),
                "session_ended",
                "session",
                serde_json::json!({
                    "session_id": self.record.id,
                    "status": status.as_str(),
                }),
                &trace_id,
            )
            .await;

        self.set_state(SessionState::Closed);
        let _ = self.events_tx.send(SessionEvent::Closed { status });
        tracing::info!(
            session_id = %self.record.id,
            status = %status.as_str(),
            total_turns = self.record.total_turns,
            "Voice session closed"
        );
    }

    fn state_snapshot(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, new: SessionState) {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            tracing::debug!(session_id = %self.record.id, ?old, ?new, "State transition");
            let _ = self.events_tx.send(SessionEvent::StateChanged { old, new });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = VoiceSessionConfig::default();
        assert_eq!(config.queue_capacity, 128);
        assert_eq!(config.turn_deadline, Duration::from_secs(7));
        assert_eq!(config.reason_deadline, Duration::from_secs(5));
        assert_eq!(config.stt_deadline, Duration::from_secs(3));
        assert_eq!(config.tts_first_chunk_deadline, Duration::from_secs(1));
        assert_eq!(config.max_stt_failures, 3);
    }
}
