//! Session adapter: the single entry point for the surrounding application
//!
//! Wires the codec, transport, audio manager and dialog machine into one
//! conversational session. One lightweight task runs per independent
//! activity, and every state mutation funnels through the command queue
//! consumed by the dialog loop, so the machine is the only writer of turn
//! state and transcript. `stop()` is safe from any state and always hands
//! back whatever transcript was accumulated, with the socket closed and the
//! audio device released before it returns.

use crate::audio::{self, rms_energy, AudioManager, AudioMode};
use crate::config::{BridgeConfig, ServiceCredentials};
use crate::dialog::{DialogAction, DialogMachine};
use crate::events::{SessionCommand, TransportEvent, TurnPhase};
use crate::plan::{CandidateIdentity, InterviewPlan, Transcript};
use crate::transport::{LinkConfig, TransportSession, VoiceLink};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Bound on waiting for the session task to confirm teardown.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("no service credentials configured")]
    MissingCredentials,

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("audio error: {0}")]
    Audio(#[from] crate::audio::AudioError),

    #[error("session task did not report back")]
    Unresponsive,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Handle to one interview session. Create, `start` once, optionally steer
/// with `inject_instruction`, then `stop` to collect the transcript. A new
/// interview needs a new handle.
pub struct InterviewSession {
    config: BridgeConfig,
    credentials: Option<ServiceCredentials>,
    session_id: uuid::Uuid,

    command_tx: Option<mpsc::Sender<SessionCommand>>,
    cancel_tx: Option<watch::Sender<bool>>,
    result_rx: Option<oneshot::Receiver<Transcript>>,
    transcript: Option<Transcript>,

    audio_released: Arc<AtomicBool>,
    link_released: Arc<AtomicBool>,
    audio_mode: Option<AudioMode>,
    started: bool,
}

impl InterviewSession {
    pub fn new(config: BridgeConfig, credentials: Option<ServiceCredentials>) -> Self {
        Self {
            config,
            credentials,
            session_id: uuid::Uuid::new_v4(),
            command_tx: None,
            cancel_tx: None,
            result_rx: None,
            transcript: None,
            audio_released: Arc::new(AtomicBool::new(false)),
            link_released: Arc::new(AtomicBool::new(false)),
            audio_mode: None,
            started: false,
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Audio mode the session settled on at start.
    pub fn audio_mode(&self) -> Option<AudioMode> {
        self.audio_mode
    }

    /// True once the audio device and threads are torn down.
    pub fn audio_released(&self) -> bool {
        self.audio_released.load(Ordering::Relaxed)
    }

    /// True once the network connection is torn down.
    pub fn link_released(&self) -> bool {
        self.link_released.load(Ordering::Relaxed)
    }

    /// Connect to the remote service and run the interview.
    pub async fn start(
        &mut self,
        plan: InterviewPlan,
        candidate: CandidateIdentity,
    ) -> Result<()> {
        if self.started {
            return Err(SessionError::AlreadyRunning);
        }
        let credentials = self
            .credentials
            .clone()
            .ok_or(SessionError::MissingCredentials)?;
        let link =
            TransportSession::connect(LinkConfig::from(&self.config), credentials).await?;
        self.start_with_link(plan, candidate, Box::new(link)).await
    }

    /// Run the interview over an already-established link. This is the seam
    /// scripted tests drive the whole session through.
    pub async fn start_with_link(
        &mut self,
        plan: InterviewPlan,
        candidate: CandidateIdentity,
        link: Box<dyn VoiceLink>,
    ) -> Result<()> {
        let primary = if self.config.force_simulated_audio {
            AudioManager::simulated(
                self.config.capture_chunk_bytes(),
                self.config.chunk_duration(),
                self.config.playback_queue_depth,
            )
        } else {
            AudioManager::hardware(
                "voxbridge",
                self.config.capture_sample_rate,
                self.config.playback_sample_rate,
                self.config.capture_chunk_bytes(),
                self.config.chunk_duration(),
                self.config.playback_queue_depth,
            )
        };
        self.start_with_parts(plan, candidate, link, primary).await
    }

    /// Fully explicit wiring: caller supplies the link and the preferred
    /// audio manager. Device failure still falls back to simulated mode.
    pub async fn start_with_parts(
        &mut self,
        plan: InterviewPlan,
        candidate: CandidateIdentity,
        link: Box<dyn VoiceLink>,
        primary_audio: AudioManager,
    ) -> Result<()> {
        if self.started {
            return Err(SessionError::AlreadyRunning);
        }

        let (audio, capture_rx) = audio::start_with_fallback(
            primary_audio,
            self.config.capture_chunk_bytes(),
            self.config.chunk_duration(),
            self.config.playback_queue_depth,
        )
        .await?;
        self.audio_mode = Some(audio.mode());

        let (command_tx, command_rx) = mpsc::channel::<SessionCommand>(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (result_tx, result_rx) = oneshot::channel::<Transcript>();

        let runtime = SessionRuntime {
            session_id: self.session_id,
            candidate: candidate.clone(),
            fsm: DialogMachine::new(plan, candidate, self.config.max_follow_ups),
            link,
            audio,
            capture_rx,
            command_rx,
            cancel_rx,
            silence_timeout: self.config.silence_timeout(),
            barge_in_threshold: self.config.barge_in_threshold,
            audio_released: self.audio_released.clone(),
            link_released: self.link_released.clone(),
        };
        tokio::spawn(runtime.run(result_tx));

        self.command_tx = Some(command_tx);
        self.cancel_tx = Some(cancel_tx);
        self.result_rx = Some(result_rx);
        self.started = true;
        info!("session {} started", self.session_id);
        Ok(())
    }

    /// Queue a supervisor steering directive. Applied at the next safe
    /// injection point, never mid-utterance.
    pub async fn inject_instruction(&self, text: impl Into<String>) -> Result<()> {
        let tx = self.command_tx.as_ref().ok_or(SessionError::NotRunning)?;
        tx.send(SessionCommand::Instruction(text.into()))
            .await
            .map_err(|_| SessionError::NotRunning)
    }

    /// Stop the session and collect the transcript. Idempotent: repeated
    /// calls return the same transcript. Guarantees the transport is closed
    /// and the audio device released before returning.
    pub async fn stop(&mut self) -> Result<Transcript> {
        if let Some(t) = &self.transcript {
            return Ok(t.clone());
        }
        if !self.started {
            return Err(SessionError::NotRunning);
        }

        if let Some(tx) = &self.cancel_tx {
            let _ = tx.send(true);
        }
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(SessionCommand::Stop).await;
        }

        let rx = self.result_rx.take().ok_or(SessionError::NotRunning)?;
        match tokio::time::timeout(STOP_TIMEOUT, rx).await {
            Ok(Ok(transcript)) => {
                self.transcript = Some(transcript.clone());
                Ok(transcript)
            }
            _ => Err(SessionError::Unresponsive),
        }
    }
}

/// Everything the session task owns. Lives on its own tokio task; the
/// handle reaches it only through channels.
struct SessionRuntime {
    session_id: uuid::Uuid,
    candidate: CandidateIdentity,
    fsm: DialogMachine,
    link: Box<dyn VoiceLink>,
    audio: AudioManager,
    capture_rx: mpsc::Receiver<crate::audio::AudioChunk>,
    command_rx: mpsc::Receiver<SessionCommand>,
    cancel_rx: watch::Receiver<bool>,
    silence_timeout: Duration,
    barge_in_threshold: f32,
    audio_released: Arc<AtomicBool>,
    link_released: Arc<AtomicBool>,
}

impl SessionRuntime {
    async fn run(mut self, result_tx: oneshot::Sender<Transcript>) {
        let started_at = Utc::now();
        self.fsm.on_command(SessionCommand::Start);
        let mut silence_deadline: Option<tokio::time::Instant> = None;
        let mut finished = self.apply_actions(&mut silence_deadline).await;
        let mut capture_done = false;

        while !finished {
            let deadline = silence_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        self.fsm.on_command(SessionCommand::Stop);
                    }
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.fsm.on_command(cmd),
                    None => self.fsm.on_command(SessionCommand::Stop),
                },

                chunk = self.capture_rx.recv(), if !capture_done => match chunk {
                    Some(chunk) => {
                        if self.fsm.phase() == TurnPhase::AgentSpeaking
                            && rms_energy(&chunk.pcm) > self.barge_in_threshold
                        {
                            // Candidate talked over the agent: cut playback
                            // locally and yield the floor.
                            self.audio.flush_playback();
                            self.fsm.on_command(SessionCommand::BargeIn);
                        }
                        if let Err(e) = self.link.send_audio(chunk.pcm).await {
                            debug!("dropping capture chunk, link unavailable: {}", e);
                        }
                    }
                    None => {
                        warn!("capture stream ended");
                        capture_done = true;
                    }
                },

                event = self.link.next_event() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        self.fsm
                            .on_command(SessionCommand::RemoteFailure("link closed".into()));
                    }
                },

                _ = tokio::time::sleep_until(deadline), if silence_deadline.is_some() => {
                    silence_deadline = None;
                    self.fsm.on_command(SessionCommand::SilenceElapsed);
                }
            }

            finished = self.apply_actions(&mut silence_deadline).await;
        }

        // Teardown runs on every exit path; the caller is owed both
        // resources released and whatever transcript exists.
        self.link.close().await;
        self.link_released
            .store(self.link.released(), Ordering::Relaxed);
        self.audio.stop().await;
        self.audio_released
            .store(self.audio.released(), Ordering::Relaxed);

        let (turns, instructions, abort) = self.fsm.finish();
        let transcript = Transcript {
            session_id: self.session_id,
            candidate: self.candidate,
            turns,
            instructions,
            started_at,
            ended_at: Utc::now(),
            aborted_reason: abort,
        };
        info!(
            "session {} finished with {} turns",
            self.session_id,
            transcript.turns.len()
        );
        let _ = result_tx.send(transcript);
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text { text, .. } => {
                self.fsm.on_command(SessionCommand::CandidateText(text));
            }
            TransportEvent::Audio { pcm, .. } => {
                self.audio.enqueue_playback(crate::audio::AudioChunk {
                    pcm,
                    duration: Duration::ZERO,
                    captured_at: std::time::Instant::now(),
                });
            }
            TransportEvent::TurnEnded { .. } => {
                self.fsm.on_command(SessionCommand::AgentTurnEnded);
            }
            TransportEvent::TurnStarted { sequence } => {
                debug!("remote turn {} started", sequence);
            }
            TransportEvent::FlushPlayback => {
                self.audio.flush_playback();
            }
            TransportEvent::RemoteError { message } => {
                // Remote error frames are logged; the session continues
                // unless the link itself gives up.
                warn!("remote error event: {}", message);
            }
            TransportEvent::Degraded => info!("link degraded, reconnecting"),
            TransportEvent::Recovered => info!("link recovered"),
            TransportEvent::HandshakeComplete => debug!("handshake event"),
            TransportEvent::ConnectionLost => {
                self.fsm.on_command(SessionCommand::RemoteFailure(
                    "connection lost after retries".into(),
                ));
            }
        }
    }

    /// Apply the machine's drained actions. True means the dialog is over.
    async fn apply_actions(&mut self, silence_deadline: &mut Option<tokio::time::Instant>) -> bool {
        let mut finished = false;
        for action in self.fsm.drain_actions() {
            match action {
                DialogAction::Speak { text, speaker, stage_index } => {
                    debug!(?speaker, stage_index, "speaking: {}", text);
                    *silence_deadline = None;
                    if let Err(e) = self.link.speak(&text).await {
                        warn!("failed to transmit utterance: {}", e);
                    }
                }
                DialogAction::SendStopSpeaking => {
                    if let Err(e) = self.link.send_stop_speaking().await {
                        warn!("failed to send stop-speaking: {}", e);
                    }
                }
                DialogAction::ArmSilenceTimer => {
                    *silence_deadline =
                        Some(tokio::time::Instant::now() + self.silence_timeout);
                }
                DialogAction::Finished => finished = true,
            }
        }
        finished
    }
}
