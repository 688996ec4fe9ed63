//! Bridge configuration
//!
//! Every timeout and bound in the bridge is a field here; nothing waits
//! unbounded. Values load from a TOML file, with defaults conservative
//! enough to run against a slow service.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// WebSocket endpoint of the remote speech-dialog service.
    pub endpoint: String,

    /// Bound on waiting for the handshake acknowledgment.
    pub handshake_timeout_ms: u64,
    /// Control ping cadence while the link is ready.
    pub heartbeat_interval_ms: u64,
    /// Inbound silence longer than this degrades the link and starts
    /// reconnection.
    pub heartbeat_grace_ms: u64,

    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub reconnect_max_retries: u32,

    /// Candidate silence treated as an empty answer after this long.
    pub silence_timeout_ms: u64,
    /// Global ceiling on follow-ups per stage; each stage may budget fewer.
    pub max_follow_ups: u32,

    pub chunk_duration_ms: u64,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,

    /// Service-defined frame ceiling; encoding a larger payload fails.
    pub max_frame_bytes: usize,
    /// Out-of-order inbound frames are held up to this many slots.
    pub reorder_window: usize,
    pub send_queue_depth: usize,
    pub playback_queue_depth: usize,

    /// RMS over i16 samples above which candidate audio counts as speech
    /// while the agent is talking.
    pub barge_in_threshold: f32,
    /// Skip device probing entirely and run on synthetic audio.
    pub force_simulated_audio: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://localhost:9443/api/v1/dialog".into(),
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_grace_ms: 15_000,
            reconnect_initial_backoff_ms: 500,
            reconnect_max_backoff_ms: 8_000,
            reconnect_max_retries: 4,
            silence_timeout_ms: 12_000,
            max_follow_ups: 2,
            chunk_duration_ms: 100,
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            max_frame_bytes: 1024 * 1024,
            reorder_window: 8,
            send_queue_depth: 64,
            playback_queue_depth: 32,
            barge_in_threshold: 900.0,
            force_simulated_audio: false,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }

    /// Capture chunk size in bytes for the configured duration, 16-bit mono.
    pub fn capture_chunk_bytes(&self) -> usize {
        (self.capture_sample_rate as u64 * self.chunk_duration_ms / 1000) as usize * 2
    }
}

/// Opaque credentials provisioned by the operator, passed through to the
/// service handshake untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCredentials {
    pub app_id: String,
    pub access_token: String,
    pub resource_id: String,
}
