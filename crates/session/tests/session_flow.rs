//! End-to-end session scenarios against scripted capability backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use colloquy_bus::BusError;
use colloquy_core::{AudioFrame, BrainReply, BrainRequest, SessionRecord, SessionStatus};
use colloquy_memory::{InMemorySessionStore, SessionStore};
use colloquy_pipeline::{
    PipelineError, ScriptedSttBackend, SilenceTtsBackend, SttBackend, SttConfig, TtsConfig,
    TtsSynthesizer,
};
use colloquy_reason::FALLBACK_REPLY;
use colloquy_session::{
    BrainClient, SessionDeps, SessionEvent, SessionSink, SessionState, VoiceSession,
    VoiceSessionConfig,
};

struct FakeBrain {
    reply_text: Option<String>,
    delay: Duration,
    /// Index the fake "persists" under; echoes the request index plus this
    /// offset (simulates duplicate resolution).
    index_offset: u32,
    calls: AtomicU32,
    requests: Mutex<Vec<BrainRequest>>,
}

impl FakeBrain {
    fn replying(text: &str) -> Self {
        Self {
            reply_text: Some(text.to_string()),
            delay: Duration::from_millis(20),
            index_offset: 0,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn timing_out() -> Self {
        Self {
            reply_text: None,
            delay: Duration::from_millis(5),
            index_offset: 0,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BrainClient for FakeBrain {
    async fn reason(
        &self,
        request: BrainRequest,
        _timeout: Duration,
        _trace_id: &str,
    ) -> Result<BrainReply, BusError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = request.turn_index + self.index_offset;
        self.requests.lock().push(request);
        tokio::time::sleep(self.delay).await;
        match &self.reply_text {
            Some(text) => Ok(BrainReply {
                text: text.clone(),
                latency_ms: self.delay.as_millis() as u64,
                turn_index: index,
                reasoning_degraded: false,
            }),
            None => Err(BusError::Timeout),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    conversation: Mutex<Vec<(String, serde_json::Value)>>,
    analytics: Mutex<Vec<(String, serde_json::Value)>>,
    audits: Mutex<Vec<String>>,
    announced: AtomicU32,
}

#[async_trait]
impl SessionSink for RecordingSink {
    async fn session_started(&self, _: &SessionRecord, _: &str) -> Result<(), BusError> {
        self.announced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn conversation_event(
        &self,
        _session_id: &str,
        event_type: &str,
        data: serde_json::Value,
        _trace_id: &str,
    ) -> Result<(), BusError> {
        self.conversation
            .lock()
            .push((event_type.to_string(), data));
        Ok(())
    }

    async fn analytics(
        &self,
        metric: &str,
        data: serde_json::Value,
        _trace_id: &str,
    ) -> Result<(), BusError> {
        self.analytics.lock().push((metric.to_string(), data));
        Ok(())
    }

    async fn audit(
        &self,
        _user_id: &str,
        action: &str,
        _resource: &str,
        _data: serde_json::Value,
        _trace_id: &str,
    ) -> Result<(), BusError> {
        self.audits.lock().push(action.to_string());
        Ok(())
    }
}

struct FailingSttBackend;

#[async_trait]
impl SttBackend for FailingSttBackend {
    async fn transcribe(&self, _: &[f32], _: u32) -> Result<String, PipelineError> {
        Err(PipelineError::Stt("decoder crashed".to_string()))
    }
}

struct Fixture {
    brain: Arc<FakeBrain>,
    sink: Arc<RecordingSink>,
    store: Arc<InMemorySessionStore>,
    deps: SessionDeps,
}

fn fixture_with(brain: FakeBrain, stt: Arc<dyn SttBackend>, tts_delay: Duration) -> Fixture {
    let brain = Arc::new(brain);
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemorySessionStore::new());
    let tts = Arc::new(TtsSynthesizer::new(
        Arc::new(SilenceTtsBackend::with_delay(16000, tts_delay)),
        TtsConfig::default(),
    ));

    let deps = SessionDeps {
        brain: brain.clone(),
        tts,
        stt_backend: stt,
        stt_config: SttConfig::default(),
        sink: sink.clone(),
        store: store.clone(),
    };

    Fixture {
        brain,
        sink,
        store,
        deps,
    }
}

fn config(user_id: &str) -> VoiceSessionConfig {
    VoiceSessionConfig {
        user_id: user_id.to_string(),
        agent_id: "agent-a".to_string(),
        ..Default::default()
    }
}

fn voiced(ts: u64) -> AudioFrame {
    AudioFrame::new(vec![0.5; 320], 16000, ts)
}

fn silent(ts: u64) -> AudioFrame {
    AudioFrame::new(vec![0.0; 320], 16000, ts)
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    description: &str,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", description))
}

/// Drive one spoken utterance: voiced frames then silence past the hangover.
fn speak_utterance(handle: &colloquy_session::VoiceSessionHandle, start_ms: u64) {
    for i in 0..5 {
        handle.push_frame(voiced(start_ms + i * 20));
    }
    handle.push_frame(silent(start_ms + 600));
}

#[tokio::test]
async fn test_happy_path_turn() {
    let fixture = fixture_with(
        FakeBrain::replying("It's 14:05 in Tokyo."),
        Arc::new(ScriptedSttBackend::new(vec![
            "What is the time in Tokyo?".to_string()
        ])),
        Duration::ZERO,
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    speak_utterance(&handle, 0);

    let transcript = wait_for(&mut events, "final transcript", |e| {
        matches!(e, SessionEvent::FinalTranscript { .. })
    })
    .await;
    match transcript {
        SessionEvent::FinalTranscript { text } => assert_eq!(text, "What is the time in Tokyo?"),
        _ => unreachable!(),
    }

    let speaking = wait_for(&mut events, "speaking", |e| {
        matches!(e, SessionEvent::Speaking { .. })
    })
    .await;
    match speaking {
        SessionEvent::Speaking { text } => assert_eq!(text, "It's 14:05 in Tokyo."),
        _ => unreachable!(),
    }

    let completed = wait_for(&mut events, "turn completed", |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;
    match completed {
        SessionEvent::TurnCompleted {
            turn_index,
            reasoning_degraded,
            ..
        } => {
            assert_eq!(turn_index, 0);
            assert!(!reasoning_degraded);
        },
        _ => unreachable!(),
    }

    wait_for(&mut events, "return to listening", |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                new: SessionState::Listening,
                ..
            }
        )
    })
    .await;

    // One reasoning call, latency analytics emitted, session still active
    assert_eq!(fixture.brain.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.brain.requests.lock()[0].turn_index, 0);
    assert_eq!(fixture.sink.analytics.lock().len(), 1);
    assert_eq!(fixture.sink.announced.load(Ordering::SeqCst), 1);

    let record = fixture
        .store
        .get(handle.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Active);
    assert_eq!(record.total_turns, 1);
    assert!(record.avg_latency_ms > 0);

    handle.leave("test done").await;
    assert_eq!(handle.join().await, Some(SessionStatus::Ended));
}

#[tokio::test]
async fn test_empty_transcript_skips_reasoning() {
    // No scripted transcript: the backend finalizes to empty text
    let fixture = fixture_with(
        FakeBrain::replying("unused"),
        Arc::new(ScriptedSttBackend::new(vec![])),
        Duration::ZERO,
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    speak_utterance(&handle, 0);

    // The session returns to listening without a reasoning call
    wait_for(&mut events, "back to listening", |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                old: SessionState::Transcribing,
                new: SessionState::Listening,
            }
        )
    })
    .await;
    assert_eq!(fixture.brain.calls.load(Ordering::SeqCst), 0);

    handle.leave("done").await;
    handle.join().await;
}

#[tokio::test]
async fn test_barge_in_during_speaking() {
    // A long reply (several chunks) with a little synthesis delay keeps the
    // session speaking long enough to interrupt
    let long_reply = "word ".repeat(40);
    let fixture = fixture_with(
        FakeBrain::replying(long_reply.trim()),
        Arc::new(ScriptedSttBackend::new(vec![
            "tell me something long".to_string(),
            "actually never mind".to_string(),
        ])),
        Duration::from_millis(200),
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    speak_utterance(&handle, 0);

    // Interrupt while the session is speaking (synthesis in flight)
    wait_for(&mut events, "speaking", |e| {
        matches!(e, SessionEvent::Speaking { .. })
    })
    .await;
    handle.push_frame(voiced(5000));

    wait_for(&mut events, "barge-in", |e| matches!(e, SessionEvent::BargeIn)).await;
    wait_for(&mut events, "transcribing after barge-in", |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                new: SessionState::Transcribing,
                ..
            }
        )
    })
    .await;

    assert!(fixture
        .sink
        .conversation
        .lock()
        .iter()
        .any(|(event_type, _)| event_type == "barge_in"));

    // Finish the barged-in utterance: a fresh turn runs
    handle.push_frame(silent(5700));
    wait_for(&mut events, "second turn speaking", |e| {
        matches!(e, SessionEvent::Speaking { .. })
    })
    .await;
    assert_eq!(fixture.brain.calls.load(Ordering::SeqCst), 2);

    handle.leave("done").await;
    handle.join().await;
}

#[tokio::test]
async fn test_reasoning_timeout_speaks_fallback() {
    let fixture = fixture_with(
        FakeBrain::timing_out(),
        Arc::new(ScriptedSttBackend::new(vec!["hello there".to_string()])),
        Duration::ZERO,
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    speak_utterance(&handle, 0);

    let speaking = wait_for(&mut events, "fallback speaking", |e| {
        matches!(e, SessionEvent::Speaking { .. })
    })
    .await;
    match speaking {
        SessionEvent::Speaking { text } => assert_eq!(text, FALLBACK_REPLY),
        _ => unreachable!(),
    }

    let completed = wait_for(&mut events, "degraded turn completed", |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;
    match completed {
        SessionEvent::TurnCompleted {
            reasoning_degraded, ..
        } => assert!(reasoning_degraded),
        _ => unreachable!(),
    }

    // Session stays live after the fallback
    wait_for(&mut events, "listening again", |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                new: SessionState::Listening,
                ..
            }
        )
    })
    .await;

    handle.leave("done").await;
    assert_eq!(handle.join().await, Some(SessionStatus::Ended));
}

#[tokio::test]
async fn test_turn_index_reconciled_from_reply() {
    // The brain reports persisting under index+2 (duplicate resolution);
    // the session's next request must start past it
    let mut brain = FakeBrain::replying("ok");
    brain.index_offset = 2;
    let fixture = fixture_with(
        brain,
        Arc::new(ScriptedSttBackend::new(vec![
            "first".to_string(),
            "second".to_string(),
        ])),
        Duration::ZERO,
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    speak_utterance(&handle, 0);
    wait_for(&mut events, "first turn", |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;

    speak_utterance(&handle, 5000);
    wait_for(&mut events, "second turn", |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;

    let requests = fixture.brain.requests.lock();
    assert_eq!(requests[0].turn_index, 0);
    // First turn persisted under 0+2=2, so the second request allocates 3
    assert_eq!(requests[1].turn_index, 3);

    handle.leave("done").await;
    handle.join().await;
}

#[tokio::test]
async fn test_consecutive_stt_failures_end_session_with_error() {
    let fixture = fixture_with(
        FakeBrain::replying("unused"),
        Arc::new(FailingSttBackend),
        Duration::ZERO,
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    // Three utterances, each failing transcription
    for round in 0..3u64 {
        speak_utterance(&handle, round * 2000);
        wait_for(&mut events, "stt failure", |e| {
            matches!(e, SessionEvent::SttFailed)
        })
        .await;
    }

    wait_for(&mut events, "session closed", |e| {
        matches!(
            e,
            SessionEvent::Closed {
                status: SessionStatus::Error
            }
        )
    })
    .await;

    assert_eq!(handle.join().await, Some(SessionStatus::Error));
    let record = fixture
        .store
        .get(handle.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Error);
}

#[tokio::test]
async fn test_first_chunk_deadline_aborts_turn() {
    // Synthesis slower than the first-chunk deadline
    let brain = FakeBrain::replying("a reply that never gets spoken");
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemorySessionStore::new());
    let deps = SessionDeps {
        brain: Arc::new(brain),
        tts: Arc::new(TtsSynthesizer::new(
            Arc::new(SilenceTtsBackend::with_delay(
                16000,
                Duration::from_millis(500),
            )),
            TtsConfig::default(),
        )),
        stt_backend: Arc::new(ScriptedSttBackend::new(vec!["hello".to_string()])),
        stt_config: SttConfig::default(),
        sink: sink.clone(),
        store,
    };

    let session_config = VoiceSessionConfig {
        user_id: "u1".to_string(),
        tts_first_chunk_deadline: Duration::from_millis(100),
        ..Default::default()
    };
    let handle = VoiceSession::spawn(session_config, deps);
    let mut events = handle.subscribe();

    handle.track_subscribed().await;
    speak_utterance(&handle, 0);

    wait_for(&mut events, "turn timeout", |e| {
        matches!(e, SessionEvent::TurnTimeout)
    })
    .await;
    wait_for(&mut events, "listening after timeout", |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                new: SessionState::Listening,
                ..
            }
        )
    })
    .await;

    assert!(sink
        .conversation
        .lock()
        .iter()
        .any(|(event_type, _)| event_type == "turn_timeout"));

    handle.leave("done").await;
    handle.join().await;
}

#[tokio::test]
async fn test_session_end_emits_lifecycle_events() {
    let fixture = fixture_with(
        FakeBrain::replying("hi"),
        Arc::new(ScriptedSttBackend::new(vec![])),
        Duration::ZERO,
    );
    let handle = VoiceSession::spawn(config("u1"), fixture.deps.clone());

    handle.track_subscribed().await;
    handle.leave("participant disconnected").await;
    assert_eq!(handle.join().await, Some(SessionStatus::Ended));

    let conversation = fixture.sink.conversation.lock();
    assert!(conversation
        .iter()
        .any(|(event_type, data)| event_type == "session_ended"
            && data["status"] == "ended"));
    let audits = fixture.sink.audits.lock();
    assert!(audits.contains(&"session_started".to_string()));
    assert!(audits.contains(&"session_ended".to_string()));
}

#[tokio::test]
async fn test_idle_timeout_finalizes_session() {
    let fixture = fixture_with(
        FakeBrain::replying("hi"),
        Arc::new(ScriptedSttBackend::new(vec![])),
        Duration::ZERO,
    );
    let session_config = VoiceSessionConfig {
        user_id: "u1".to_string(),
        idle_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let handle = VoiceSession::spawn(session_config, fixture.deps.clone());
    handle.track_subscribed().await;

    // No frames arrive: the session finalizes on its own
    assert_eq!(handle.join().await, Some(SessionStatus::Ended));
    let record = fixture
        .store
        .get(handle.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Ended);
}

#[tokio::test]
async fn test_frame_overflow_drops_oldest() {
    let fixture = fixture_with(
        FakeBrain::replying("hi"),
        Arc::new(ScriptedSttBackend::new(vec![])),
        Duration::ZERO,
    );
    let session_config = VoiceSessionConfig {
        user_id: "u1".to_string(),
        queue_capacity: 4,
        ..Default::default()
    };
    let handle = VoiceSession::spawn(session_config, fixture.deps.clone());

    // Session is idle (no track subscribed), frames accumulate and overflow
    for ts in 0..10u64 {
        handle.push_frame(silent(ts * 20));
    }
    assert_eq!(handle.frames_dropped(), 6);

    handle.leave("done").await;
    handle.join().await;
}
