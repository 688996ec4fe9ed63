//! Shared event and command types crossing component boundaries

/// What the transport surfaces to the session after decode and reordering.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    HandshakeComplete,
    /// Recognized text from the remote side (candidate speech or agent
    /// speech echoed back as text).
    Text { text: String, sequence: u32 },
    /// Synthesized audio to play back.
    Audio { pcm: Vec<u8>, sequence: u32 },
    TurnStarted { sequence: u32 },
    /// The remote finished emitting a turn, ours or theirs.
    TurnEnded { sequence: u32 },
    RemoteError { message: String },
    /// Remote directive to discard queued playback.
    FlushPlayback,
    /// No inbound traffic within the grace period; reconnecting.
    Degraded,
    Recovered,
    /// Reconnection retries exhausted. Fatal for the session.
    ConnectionLost,
}

/// Commands consumed by the dialog loop, the single serialized decision
/// point. Every state mutation in the session funnels through this queue.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Start,
    CandidateText(String),
    AgentTurnEnded,
    SilenceElapsed,
    BargeIn,
    Instruction(String),
    RemoteFailure(String),
    Stop,
}

/// Coarse view of who holds the floor right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    AgentSpeaking,
    CandidateSpeaking,
    Processing,
}
