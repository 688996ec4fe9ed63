//! Wire codec for the remote speech-dialog service
//!
//! Frames are a fixed binary header followed by the payload. The header
//! packs version and size into the first byte the same way the vendor
//! protocol does, with all multi-byte integers big-endian:
//!
//! ```text
//! byte 0      : version (upper nibble) | header size in 4-byte words (lower)
//! byte 1      : kind tag
//! bytes 2..4  : reserved, zero
//! bytes 4..8  : sequence, u32
//! bytes 8..16 : timestamp, unix millis, u64
//! bytes 16..20: payload length, u32
//! bytes 20..  : payload (raw PCM or UTF-8 text, by kind)
//! ```
//!
//! Encoding and decoding are pure transformations; nothing here touches a
//! socket, which is what keeps the transport layer testable without one.

use std::time::{SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;
/// Service-defined frame ceiling. Large audio must be pre-chunked by the
/// caller well below this.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

const HEADER_WORDS: u8 = (HEADER_LEN / 4) as u8;

const TAG_HANDSHAKE: u8 = 0x01;
const TAG_AUDIO_CHUNK: u8 = 0x02;
const TAG_TEXT_CHUNK: u8 = 0x03;
const TAG_TURN_START: u8 = 0x04;
const TAG_TURN_END: u8 = 0x05;
const TAG_ERROR: u8 = 0x06;
const TAG_CONTROL: u8 = 0x07;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload of {got} bytes exceeds frame ceiling of {max}")]
    PayloadTooLarge { got: usize, max: usize },

    #[error("truncated frame: {got} bytes, need at least {need}")]
    Truncated { got: usize, need: usize },

    #[error("header declares {declared} payload bytes but {got} are present")]
    LengthMismatch { declared: usize, got: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("frame kind {kind:?} requires UTF-8 text payload")]
    InvalidText { kind: FrameKind },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Message kinds on the wire. Unknown tags from the remote side decode to
/// `Control` so forward-compatible additions never break the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake,
    AudioChunk,
    TextChunk,
    TurnStart,
    TurnEnd,
    Error,
    Control,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Handshake => TAG_HANDSHAKE,
            FrameKind::AudioChunk => TAG_AUDIO_CHUNK,
            FrameKind::TextChunk => TAG_TEXT_CHUNK,
            FrameKind::TurnStart => TAG_TURN_START,
            FrameKind::TurnEnd => TAG_TURN_END,
            FrameKind::Error => TAG_ERROR,
            FrameKind::Control => TAG_CONTROL,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            TAG_HANDSHAKE => FrameKind::Handshake,
            TAG_AUDIO_CHUNK => FrameKind::AudioChunk,
            TAG_TEXT_CHUNK => FrameKind::TextChunk,
            TAG_TURN_START => FrameKind::TurnStart,
            TAG_TURN_END => FrameKind::TurnEnd,
            TAG_ERROR => FrameKind::Error,
            _ => FrameKind::Control,
        }
    }

    /// Kinds whose payload must be valid UTF-8. `Control` is exempt since
    /// unknown remote kinds land there with their raw bytes intact.
    fn requires_text(self) -> bool {
        matches!(
            self,
            FrameKind::Handshake | FrameKind::TextChunk | FrameKind::Error
        )
    }
}

/// One framed unit exchanged with the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceMessage {
    pub kind: FrameKind,
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl VoiceMessage {
    pub fn new(kind: FrameKind, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            sequence,
            timestamp_ms: now_millis(),
            payload,
        }
    }

    pub fn handshake(sequence: u32, body: &serde_json::Value) -> Self {
        Self::new(FrameKind::Handshake, sequence, body.to_string().into_bytes())
    }

    pub fn audio(sequence: u32, pcm: Vec<u8>) -> Self {
        Self::new(FrameKind::AudioChunk, sequence, pcm)
    }

    pub fn text(sequence: u32, text: impl Into<String>) -> Self {
        Self::new(FrameKind::TextChunk, sequence, text.into().into_bytes())
    }

    pub fn turn_start(sequence: u32) -> Self {
        Self::new(FrameKind::TurnStart, sequence, Vec::new())
    }

    pub fn turn_end(sequence: u32) -> Self {
        Self::new(FrameKind::TurnEnd, sequence, Vec::new())
    }

    pub fn control(sequence: u32, payload: Vec<u8>) -> Self {
        Self::new(FrameKind::Control, sequence, payload)
    }

    /// Payload as text, for text-bearing kinds.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stateless frame codec. The payload ceiling is the only knob.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameCodec {
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn encode(&self, msg: &VoiceMessage) -> Result<Vec<u8>> {
        if msg.payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                got: msg.payload.len(),
                max: self.max_payload,
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + msg.payload.len());
        out.push((PROTOCOL_VERSION << 4) | HEADER_WORDS);
        out.push(msg.kind.tag());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&msg.sequence.to_be_bytes());
        out.extend_from_slice(&msg.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&(msg.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&msg.payload);
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<VoiceMessage> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                got: bytes.len(),
                need: HEADER_LEN,
            });
        }

        let version = bytes[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        // Honor the declared header size so a future extension header is
        // skipped rather than misread as payload.
        let header_len = ((bytes[0] & 0x0f) as usize) * 4;
        if header_len < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                got: header_len,
                need: HEADER_LEN,
            });
        }
        if bytes.len() < header_len {
            return Err(ProtocolError::Truncated {
                got: bytes.len(),
                need: header_len,
            });
        }

        let kind = FrameKind::from_tag(bytes[1]);
        let sequence = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let timestamp_ms = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let declared = u32::from_be_bytes(bytes[16..20].try_into().unwrap()) as usize;

        let payload = &bytes[header_len..];
        if payload.len() != declared {
            return Err(ProtocolError::LengthMismatch {
                declared,
                got: payload.len(),
            });
        }

        if kind.requires_text() && std::str::from_utf8(payload).is_err() {
            return Err(ProtocolError::InvalidText { kind });
        }

        Ok(VoiceMessage {
            kind,
            sequence,
            timestamp_ms,
            payload: payload.to_vec(),
        })
    }
}

/// Result of checking one observed sequence number against the expected
/// progression for a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    InOrder,
    /// `width` numbers were skipped; treated as a possible drop. The
    /// protocol is best-effort, so the gap is logged and never retransmitted.
    Gap { width: u32 },
    /// At or behind a number already seen.
    Stale,
}

/// Per-direction sequence progression. Numbers are never reused within a
/// session; a fresh tracker goes with a fresh connection.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next_expected: Option<u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seq: u32) -> SeqCheck {
        let check = match self.next_expected {
            None => SeqCheck::InOrder,
            Some(expected) if seq == expected => SeqCheck::InOrder,
            Some(expected) if seq > expected => SeqCheck::Gap {
                width: seq - expected,
            },
            Some(_) => SeqCheck::Stale,
        };
        if !matches!(check, SeqCheck::Stale) {
            self.next_expected = Some(seq.wrapping_add(1));
        }
        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_kinds() {
        let codec = FrameCodec::default();
        let messages = vec![
            VoiceMessage::handshake(0, &serde_json::json!({"app_id": "a1"})),
            VoiceMessage::audio(1, vec![0x00, 0x01, 0xfe, 0xff]),
            VoiceMessage::text(2, "tell me about your project"),
            VoiceMessage::turn_start(3),
            VoiceMessage::turn_end(4),
            VoiceMessage::new(FrameKind::Error, 5, b"quota exceeded".to_vec()),
            VoiceMessage::control(6, b"ping".to_vec()),
        ];
        for msg in messages {
            let bytes = codec.encode(&msg).unwrap();
            let back = codec.decode(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn unknown_kind_decodes_as_control() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(&VoiceMessage::control(9, b"x".to_vec())).unwrap();
        bytes[1] = 0x3c; // tag from a future protocol revision
        let msg = codec.decode(&bytes).unwrap();
        assert_eq!(msg.kind, FrameKind::Control);
        assert_eq!(msg.payload, b"x");
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let codec = FrameCodec::default();
        let bytes = codec.encode(&VoiceMessage::text(0, "hello")).unwrap();
        let err = codec.decode(&bytes[..HEADER_LEN - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(&VoiceMessage::text(0, "hello")).unwrap();
        bytes.truncate(bytes.len() - 2);
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch { .. }));
    }

    #[test]
    fn oversized_payload_fails_encode() {
        let codec = FrameCodec::with_max_payload(16);
        let err = codec
            .encode(&VoiceMessage::audio(0, vec![0u8; 17]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn bad_version_is_rejected() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(&VoiceMessage::turn_start(0)).unwrap();
        bytes[0] = (9 << 4) | (bytes[0] & 0x0f);
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(9)));
    }

    #[test]
    fn non_utf8_text_frame_is_rejected() {
        let codec = FrameCodec::default();
        let bytes = codec
            .encode(&VoiceMessage::new(
                FrameKind::TextChunk,
                0,
                vec![0xff, 0xfe, 0x00],
            ))
            .unwrap();
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidText { .. }));
    }

    #[test]
    fn sequence_gap_is_reported_not_fatal() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(0), SeqCheck::InOrder);
        assert_eq!(tracker.observe(1), SeqCheck::InOrder);
        assert_eq!(tracker.observe(4), SeqCheck::Gap { width: 2 });
        assert_eq!(tracker.observe(5), SeqCheck::InOrder);
        assert_eq!(tracker.observe(3), SeqCheck::Stale);
    }
}
