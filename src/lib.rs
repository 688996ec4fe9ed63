//! voxbridge - real-time voice interview bridge
//!
//! Turns a scripted interview plan into a live, turn-taking spoken
//! conversation with a remote speech-dialog service, while letting a human
//! supervisor inject steering instructions mid-conversation without
//! breaking protocol state.
//!
//! The [`session::InterviewSession`] adapter is the only type the
//! surrounding application needs; everything below it (codec, transport,
//! audio, dialog machine) is wired up internally.

#![forbid(unsafe_code)]

/// Audio capture and playback, hardware or simulated
pub mod audio;
/// Recognized options and service credentials
pub mod config;
/// The interview dialog state machine
pub mod dialog;
/// Cross-component command and event types
pub mod events;
/// Plan and transcript data model shared with collaborators
pub mod plan;
/// Wire codec for the framed service protocol
pub mod protocol;
/// The session adapter facade
pub mod session;
/// The duplex connection to the remote service
pub mod transport;

pub use config::{BridgeConfig, ServiceCredentials};
pub use plan::{CandidateIdentity, InterviewPlan, Stage, Transcript};
pub use session::{InterviewSession, SessionError};
