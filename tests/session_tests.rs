//! End-to-end session tests over a scripted link and synthetic audio.
//!
//! No socket and no sound card: the link double plays the remote service
//! (acknowledging utterances with turn-end events and answering per
//! script), and the audio side runs the same simulated path production
//! falls back to.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voxbridge::audio::{AudioChunk, AudioManager, AudioMode, AudioSink, AudioSource};
use voxbridge::events::TransportEvent;
use voxbridge::plan::{InstructionStatus, Speaker, Stage};
use voxbridge::transport::{self, VoiceLink};
use voxbridge::{BridgeConfig, CandidateIdentity, InterviewPlan, InterviewSession, SessionError};

/// Remote-service double. Each spoken utterance is acknowledged with a
/// `TurnEnded`; the answer script decides whether the candidate then
/// "says" something.
struct ScriptedLink {
    /// Per-utterance candidate reaction, keyed on the spoken text.
    answers: Box<dyn FnMut(&str) -> Option<String> + Send>,
    /// Acknowledge utterances with turn-end events (off to simulate a
    /// stalled remote turn).
    auto_turn_end: bool,
    event_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    spoken: Arc<Mutex<Vec<String>>>,
    stop_speaks: Arc<AtomicUsize>,
    audio_chunks: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ScriptedLink {
    fn new(answers: Box<dyn FnMut(&str) -> Option<String> + Send>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            answers,
            auto_turn_end: true,
            event_tx: Some(event_tx),
            event_rx,
            spoken: Arc::new(Mutex::new(Vec::new())),
            stop_speaks: Arc::new(AtomicUsize::new(0)),
            audio_chunks: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn handles(&self) -> (Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        (self.spoken.clone(), self.stop_speaks.clone(), self.closed.clone())
    }

    fn push(&self, event: TransportEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl VoiceLink for ScriptedLink {
    async fn speak(&mut self, text: &str) -> transport::Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        let base = (self.spoken.lock().unwrap().len() * 10) as u32;
        if self.auto_turn_end {
            self.push(TransportEvent::TurnEnded { sequence: base });
        }
        if let Some(answer) = (self.answers)(text) {
            self.push(TransportEvent::Text {
                text: answer,
                sequence: base + 1,
            });
        }
        Ok(())
    }

    async fn send_audio(&mut self, _pcm: Vec<u8>) -> transport::Result<()> {
        self.audio_chunks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_stop_speaking(&mut self) -> transport::Result<()> {
        self.stop_speaks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    async fn close(&mut self) {
        self.event_tx = None;
        self.closed.store(true, Ordering::Relaxed);
    }

    fn released(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Answers every question-shaped utterance, in order.
fn answer_script(answers: Vec<&str>) -> Box<dyn FnMut(&str) -> Option<String> + Send> {
    let mut queue: VecDeque<String> = answers.into_iter().map(String::from).collect();
    Box::new(move |utterance| {
        if utterance.contains('?') {
            queue.pop_front()
        } else {
            None
        }
    })
}

fn silent_script() -> Box<dyn FnMut(&str) -> Option<String> + Send> {
    Box::new(|_| None)
}

fn test_config() -> BridgeConfig {
    BridgeConfig {
        force_simulated_audio: true,
        chunk_duration_ms: 10,
        silence_timeout_ms: 100,
        max_follow_ups: 1,
        ..BridgeConfig::default()
    }
}

fn plan(stages: usize) -> InterviewPlan {
    InterviewPlan {
        stages: (0..stages)
            .map(|i| Stage {
                prompt: format!("Question {}?", i + 1),
                expected_follow_ups: 1,
                time_budget: Duration::from_secs(120),
            })
            .collect(),
        greeting: None,
        closing: None,
    }
}

fn candidate() -> CandidateIdentity {
    CandidateIdentity {
        name: "Ada".into(),
        identifier: "c-1".into(),
    }
}

async fn wait_until(deadline_ms: u64, mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..(deadline_ms / 10).max(1) {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    probe()
}

#[tokio::test]
async fn three_stage_interview_produces_alternating_transcript() {
    let link = ScriptedLink::new(answer_script(vec![
        "I built a search engine",
        "We shard by tenant",
        "Mostly caching",
    ]));
    let (_, _, closed) = link.handles();

    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_link(plan(3), candidate(), Box::new(link))
        .await
        .unwrap();

    assert!(wait_until(2_000, || closed.load(Ordering::Relaxed)).await);

    let transcript = session.stop().await.unwrap();
    assert!(transcript.aborted_reason.is_none());
    assert_eq!(transcript.turns.len(), 6);
    for (i, turn) in transcript.turns.iter().enumerate() {
        let expected = if i % 2 == 0 {
            Speaker::Agent
        } else {
            Speaker::Candidate
        };
        assert_eq!(turn.speaker, expected, "turn {}", i);
        assert_eq!(turn.stage_index, i / 2);
    }
    assert_eq!(transcript.turns[1].text, "I built a search engine");
    assert!(session.audio_released());
    assert!(session.link_released());
}

#[tokio::test]
async fn second_start_fails_with_already_running() {
    let link = ScriptedLink::new(silent_script());
    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_link(plan(1), candidate(), Box::new(link))
        .await
        .unwrap();

    let second = ScriptedLink::new(silent_script());
    let err = session
        .start_with_link(plan(1), candidate(), Box::new(second))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyRunning));

    session.stop().await.unwrap();
}

#[tokio::test]
async fn silence_consumes_follow_up_budget_then_session_ends() {
    // Nobody ever answers; the 100ms silence timeout drives the interview
    // to completion through one follow-up per stage.
    let link = ScriptedLink::new(silent_script());
    let (spoken, _, closed) = link.handles();

    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_link(plan(1), candidate(), Box::new(link))
        .await
        .unwrap();

    assert!(wait_until(3_000, || closed.load(Ordering::Relaxed)).await);
    let transcript = session.stop().await.unwrap();

    // Prompt, follow-up re-prompt, and two empty candidate turns.
    assert_eq!(spoken.lock().unwrap().len(), 2);
    let candidate_turns: Vec<_> = transcript
        .turns
        .iter()
        .filter(|t| t.speaker == Speaker::Candidate)
        .collect();
    assert_eq!(candidate_turns.len(), 2);
    assert!(candidate_turns.iter().all(|t| t.text.is_empty()));
}

#[tokio::test]
async fn instruction_applied_at_safe_point_never_left_pending() {
    // The candidate stays silent, so the first safe injection point is the
    // listening-to-evaluating boundary 300ms in, well after the injection.
    let link = ScriptedLink::new(silent_script());
    let (_, _, closed) = link.handles();

    let mut config = test_config();
    config.silence_timeout_ms = 300;
    let mut session = InterviewSession::new(config, None);
    session
        .start_with_link(plan(1), candidate(), Box::new(link))
        .await
        .unwrap();
    session
        .inject_instruction("probe the consistency story")
        .await
        .unwrap();

    assert!(wait_until(3_000, || closed.load(Ordering::Relaxed)).await);
    let transcript = session.stop().await.unwrap();

    assert_eq!(transcript.instructions.len(), 1);
    let ins = &transcript.instructions[0];
    assert_eq!(ins.status, InstructionStatus::Applied);
    assert!(ins.applied_at.unwrap() >= ins.received_at);
    assert!(transcript
        .turns
        .iter()
        .any(|t| t.speaker == Speaker::SupervisorOverride
            && t.text == "probe the consistency story"));
}

#[tokio::test]
async fn instruction_dropped_when_stopped_before_safe_point() {
    // The remote never acknowledges the first utterance, so no safe
    // injection point is ever reached.
    let mut link = ScriptedLink::new(silent_script());
    link.auto_turn_end = false;

    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_link(plan(1), candidate(), Box::new(link))
        .await
        .unwrap();
    session.inject_instruction("wrap up early").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transcript = session.stop().await.unwrap();
    assert_eq!(transcript.instructions.len(), 1);
    assert!(matches!(
        transcript.instructions[0].status,
        InstructionStatus::Dropped { .. }
    ));
    assert!(session.audio_released());
    assert!(session.link_released());
}

/// Capture source that emits loud chunks, the shape of a candidate talking
/// over the agent.
struct LoudSource {
    cadence: Duration,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl AudioSource for LoudSource {
    async fn start_capture(&mut self) -> voxbridge::audio::Result<mpsc::Receiver<AudioChunk>> {
        let (tx, rx) = mpsc::channel(8);
        let cadence = self.cadence;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            let pcm: Vec<u8> = std::iter::repeat(12_000i16.to_le_bytes())
                .take(160)
                .flatten()
                .collect();
            loop {
                ticker.tick().await;
                let chunk = AudioChunk {
                    pcm: pcm.clone(),
                    duration: cadence,
                    captured_at: std::time::Instant::now(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn stop_capture(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn released(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Sink double that only tracks release state.
struct NullSink {
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl AudioSink for NullSink {
    async fn start_playback(&mut self) -> voxbridge::audio::Result<()> {
        Ok(())
    }
    fn enqueue(&self, _chunk: AudioChunk) {}
    fn flush(&self) {}
    async fn stop_playback(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
    fn released(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
    fn dropped_chunks(&self) -> u64 {
        0
    }
}

#[tokio::test]
async fn barge_in_sends_stop_speak_and_yields_floor() {
    // The remote stalls mid-utterance (no turn-end), the candidate speaks:
    // the session must cut the agent off, not wait for the script.
    let mut link = ScriptedLink::new(silent_script());
    link.auto_turn_end = false;
    let (_, stop_speaks, _) = link.handles();

    let audio = AudioManager::from_parts(
        AudioMode::Simulated,
        Box::new(LoudSource {
            cadence: Duration::from_millis(10),
            stopped: Arc::new(AtomicBool::new(false)),
        }),
        Box::new(NullSink {
            stopped: Arc::new(AtomicBool::new(false)),
        }),
    );

    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_parts(plan(1), candidate(), Box::new(link), audio)
        .await
        .unwrap();

    assert!(wait_until(1_000, || stop_speaks.load(Ordering::Relaxed) > 0).await);

    let transcript = session.stop().await.unwrap();
    // The interrupted utterance is still on the record as an agent turn.
    assert!(transcript.turns.iter().any(|t| t.speaker == Speaker::Agent));
    assert!(session.audio_released());
}

#[tokio::test]
async fn device_failure_at_start_runs_session_simulated() {
    struct DeadSource;

    #[async_trait]
    impl AudioSource for DeadSource {
        async fn start_capture(
            &mut self,
        ) -> voxbridge::audio::Result<mpsc::Receiver<AudioChunk>> {
            Err(voxbridge::audio::AudioError::DeviceUnavailable(
                "no such device".into(),
            ))
        }
        async fn stop_capture(&mut self) {}
        fn released(&self) -> bool {
            true
        }
    }

    let link = ScriptedLink::new(answer_script(vec!["only answer"]));
    let (_, _, closed) = link.handles();
    let broken = AudioManager::from_parts(
        AudioMode::Hardware,
        Box::new(DeadSource),
        Box::new(NullSink {
            stopped: Arc::new(AtomicBool::new(false)),
        }),
    );

    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_parts(plan(1), candidate(), Box::new(link), broken)
        .await
        .unwrap();
    assert_eq!(session.audio_mode(), Some(AudioMode::Simulated));

    assert!(wait_until(2_000, || closed.load(Ordering::Relaxed)).await);
    let transcript = session.stop().await.unwrap();
    assert_eq!(transcript.turns.len(), 2);
    assert!(session.audio_released());
    assert!(session.link_released());
}

#[tokio::test]
async fn stop_is_idempotent_and_preserves_transcript() {
    let link = ScriptedLink::new(answer_script(vec!["one"]));
    let mut session = InterviewSession::new(test_config(), None);
    session
        .start_with_link(plan(1), candidate(), Box::new(link))
        .await
        .unwrap();

    let first = session.stop().await.unwrap();
    let second = session.stop().await.unwrap();
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(first.turns.len(), second.turns.len());
    assert!(session.audio_released());
    assert!(session.link_released());
}
