//! Audio I/O manager
//!
//! Produces fixed-duration capture chunks and consumes playback chunks on a
//! cadence independent of network timing. Hardware mode talks to PulseAudio
//! via the simple blocking API on dedicated OS threads; simulated mode emits
//! synthetic silence at the identical cadence so the rest of the pipeline
//! never notices the difference. The mode is chosen at session start and
//! fixed for the session's lifetime.

use async_trait::async_trait;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// No usable device: enumeration failure, missing driver or permission
    /// denial. The session adapter treats this as "fall back to simulated",
    /// never as fatal.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Operating mode, fixed for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Hardware,
    Simulated,
}

/// One fixed-duration chunk of 16-bit little-endian mono PCM.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub pcm: Vec<u8>,
    pub duration: Duration,
    pub captured_at: Instant,
}

impl AudioChunk {
    pub fn silence(bytes: usize, duration: Duration) -> Self {
        Self {
            pcm: vec![0u8; bytes],
            duration,
            captured_at: Instant::now(),
        }
    }
}

/// RMS energy over the chunk's i16 samples. Used for barge-in detection
/// while the agent is speaking.
pub fn rms_energy(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let mut sum = 0f64;
    let mut n = 0usize;
    for pair in pcm.chunks_exact(2) {
        let s = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum += s * s;
        n += 1;
    }
    (sum / n as f64).sqrt() as f32
}

/// Accumulates irregular device buffers and re-slices them into chunks of
/// exactly `chunk_bytes`, keeping chunk boundaries time-aligned no matter
/// what sizes the device delivers.
#[derive(Debug)]
pub struct ChunkAssembler {
    chunk_bytes: usize,
    chunk_duration: Duration,
    pending: Vec<u8>,
}

impl ChunkAssembler {
    pub fn new(chunk_bytes: usize, chunk_duration: Duration) -> Self {
        Self {
            chunk_bytes,
            chunk_duration,
            pending: Vec::with_capacity(chunk_bytes * 2),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_bytes {
            let pcm: Vec<u8> = self.pending.drain(..self.chunk_bytes).collect();
            out.push(AudioChunk {
                pcm,
                duration: self.chunk_duration,
                captured_at: Instant::now(),
            });
        }
        out
    }
}

/// Bounded playback buffer. Overflow drops the oldest unplayed chunk; an
/// audible glitch is preferred over unbounded latency growth.
#[derive(Debug)]
pub struct PlaybackQueue {
    chunks: VecDeque<AudioChunk>,
    depth: usize,
    dropped: u64,
}

impl PlaybackQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(depth),
            depth,
            dropped: 0,
        }
    }

    /// Returns the chunk evicted to make room, if any.
    pub fn push(&mut self, chunk: AudioChunk) -> Option<AudioChunk> {
        let evicted = if self.chunks.len() >= self.depth {
            self.dropped += 1;
            self.chunks.pop_front()
        } else {
            None
        };
        self.chunks.push_back(chunk);
        evicted
    }

    pub fn pop(&mut self) -> Option<AudioChunk> {
        self.chunks.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.chunks.len();
        self.chunks.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Capture capability. Hardware and simulated variants share this seam so
/// the session wiring is identical in both modes.
#[async_trait]
pub trait AudioSource: Send {
    /// Begin capture, yielding fixed-duration chunks. Infinite until
    /// `stop`; restartable only via a fresh call after `stop`.
    async fn start_capture(&mut self) -> Result<mpsc::Receiver<AudioChunk>>;

    async fn stop_capture(&mut self);

    /// True once the underlying device and threads are torn down.
    fn released(&self) -> bool;
}

/// Playback capability, mirroring [`AudioSource`].
#[async_trait]
pub trait AudioSink: Send {
    async fn start_playback(&mut self) -> Result<()>;

    /// Append to the bounded playback queue. Full queue drops the oldest
    /// unplayed chunk and records it.
    fn enqueue(&self, chunk: AudioChunk);

    /// Discard everything queued but not yet played.
    fn flush(&self);

    async fn stop_playback(&mut self);

    fn released(&self) -> bool;

    fn dropped_chunks(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Hardware mode (PulseAudio)
// ---------------------------------------------------------------------------

/// Microphone capture through PulseAudio's simple API. The blocking reads
/// live on a dedicated OS thread that feeds a tokio channel, the same shape
/// the rest of the session consumes from the simulated source.
pub struct PulseSource {
    app_name: String,
    sample_rate: u32,
    chunk_bytes: usize,
    chunk_duration: Duration,
    shutdown: Arc<AtomicBool>,
    running: bool,
}

impl PulseSource {
    pub fn new(
        app_name: &str,
        sample_rate: u32,
        chunk_bytes: usize,
        chunk_duration: Duration,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            sample_rate,
            chunk_bytes,
            chunk_duration,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: false,
        }
    }
}

impl Drop for PulseSource {
    fn drop(&mut self) {
        // The capture thread exits once it observes the flag.
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl AudioSource for PulseSource {
    async fn start_capture(&mut self) -> Result<mpsc::Receiver<AudioChunk>> {
        if self.running {
            return Err(AudioError::Backend("capture already running".into()));
        }

        let (tx, rx) = mpsc::channel::<AudioChunk>(32);
        // The device open happens on the capture thread (the handle is not
        // Send); the result comes back over a one-shot channel so failures
        // surface here as DeviceUnavailable.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        let shutdown = Arc::new(AtomicBool::new(false));
        self.shutdown = shutdown.clone();
        let app_name = self.app_name.clone();
        let sample_rate = self.sample_rate;
        let chunk_bytes = self.chunk_bytes;
        let chunk_duration = self.chunk_duration;

        std::thread::spawn(move || {
            let spec = Spec {
                format: Format::S16le,
                channels: 1,
                rate: sample_rate,
            };
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Record,
                None,
                "capture",
                &spec,
                None,
                None,
            ) {
                Ok(s) => {
                    let _ = open_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = open_tx.send(Err(format!("{}", e)));
                    return;
                }
            };

            let mut assembler = ChunkAssembler::new(chunk_bytes, chunk_duration);
            let mut buf = vec![0u8; chunk_bytes];
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = simple.read(&mut buf) {
                    warn!("pulse read failed, stopping capture: {}", e);
                    break;
                }
                for chunk in assembler.push(&buf) {
                    if tx.blocking_send(chunk).is_err() {
                        return; // receiver gone
                    }
                }
            }
        });

        match open_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                info!("hardware capture started at {} Hz", self.sample_rate);
                self.running = true;
                Ok(rx)
            }
            Ok(Err(e)) => Err(AudioError::DeviceUnavailable(e)),
            Err(_) => Err(AudioError::DeviceUnavailable(
                "timed out opening capture device".into(),
            )),
        }
    }

    async fn stop_capture(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.running = false;
    }

    fn released(&self) -> bool {
        !self.running
    }
}

/// Speaker playback through PulseAudio. A dedicated OS thread drains the
/// shared bounded queue and writes to the device.
pub struct PulseSink {
    app_name: String,
    sample_rate: u32,
    queue: Arc<Mutex<PlaybackQueue>>,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    running: bool,
}

impl PulseSink {
    pub fn new(app_name: &str, sample_rate: u32, queue_depth: usize) -> Self {
        Self {
            app_name: app_name.to_string(),
            sample_rate,
            queue: Arc::new(Mutex::new(PlaybackQueue::new(queue_depth))),
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: false,
        }
    }
}

impl Drop for PulseSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl AudioSink for PulseSink {
    async fn start_playback(&mut self) -> Result<()> {
        if self.running {
            return Err(AudioError::Backend("playback already running".into()));
        }

        let (open_tx, open_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        self.shutdown = shutdown.clone();
        let queue = self.queue.clone();
        let app_name = self.app_name.clone();
        let sample_rate = self.sample_rate;

        std::thread::spawn(move || {
            let spec = Spec {
                format: Format::S16le,
                channels: 1,
                rate: sample_rate,
            };
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Playback,
                None,
                "playback",
                &spec,
                None,
                None,
            ) {
                Ok(s) => {
                    let _ = open_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = open_tx.send(Err(format!("{}", e)));
                    return;
                }
            };

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let next = queue.lock().ok().and_then(|mut q| q.pop());
                match next {
                    Some(chunk) => {
                        if let Err(e) = simple.write(&chunk.pcm) {
                            warn!("pulse write failed, stopping playback: {}", e);
                            break;
                        }
                    }
                    // Device-paced loop; nothing queued means real silence.
                    None => std::thread::sleep(Duration::from_millis(10)),
                }
            }
            let _ = simple.drain();
        });

        match open_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                info!("hardware playback started at {} Hz", self.sample_rate);
                self.running = true;
                Ok(())
            }
            Ok(Err(e)) => Err(AudioError::DeviceUnavailable(e)),
            Err(_) => Err(AudioError::DeviceUnavailable(
                "timed out opening playback device".into(),
            )),
        }
    }

    fn enqueue(&self, chunk: AudioChunk) {
        if let Ok(mut q) = self.queue.lock() {
            if let Some(evicted) = q.push(chunk) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "playback queue full, dropped {}ms of audio",
                    evicted.duration.as_millis()
                );
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut q) = self.queue.lock() {
            let n = q.clear();
            if n > 0 {
                debug!("flushed {} queued playback chunks", n);
            }
        }
    }

    async fn stop_playback(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.running = false;
    }

    fn released(&self) -> bool {
        !self.running
    }

    fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Simulated mode
// ---------------------------------------------------------------------------

/// Deterministic silence source emitting chunks on the same cadence as the
/// hardware path. Active automatically when no device is available.
pub struct SimulatedSource {
    chunk_bytes: usize,
    chunk_duration: Duration,
    shutdown: Arc<AtomicBool>,
    running: bool,
}

impl SimulatedSource {
    pub fn new(chunk_bytes: usize, chunk_duration: Duration) -> Self {
        Self {
            chunk_bytes,
            chunk_duration,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: false,
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl AudioSource for SimulatedSource {
    async fn start_capture(&mut self) -> Result<mpsc::Receiver<AudioChunk>> {
        if self.running {
            return Err(AudioError::Backend("capture already running".into()));
        }
        let (tx, rx) = mpsc::channel::<AudioChunk>(32);
        let shutdown = Arc::new(AtomicBool::new(false));
        self.shutdown = shutdown.clone();
        let chunk_bytes = self.chunk_bytes;
        let chunk_duration = self.chunk_duration;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(chunk_duration);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let chunk = AudioChunk::silence(chunk_bytes, chunk_duration);
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        info!("simulated capture started ({}ms cadence)", chunk_duration.as_millis());
        self.running = true;
        Ok(rx)
    }

    async fn stop_capture(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.running = false;
    }

    fn released(&self) -> bool {
        !self.running
    }
}

/// Playback sink that drains its queue on the chunk cadence without touching
/// any device.
pub struct SimulatedSink {
    queue: Arc<Mutex<PlaybackQueue>>,
    dropped: Arc<AtomicU64>,
    chunk_duration: Duration,
    shutdown: Arc<AtomicBool>,
    running: bool,
}

impl SimulatedSink {
    pub fn new(queue_depth: usize, chunk_duration: Duration) -> Self {
        Self {
            queue: Arc::new(Mutex::new(PlaybackQueue::new(queue_depth))),
            dropped: Arc::new(AtomicU64::new(0)),
            chunk_duration,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: false,
        }
    }
}

impl Drop for SimulatedSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl AudioSink for SimulatedSink {
    async fn start_playback(&mut self) -> Result<()> {
        if self.running {
            return Err(AudioError::Backend("playback already running".into()));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        self.shutdown = shutdown.clone();
        let queue = self.queue.clone();
        let cadence = self.chunk_duration;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Ok(mut q) = queue.lock() {
                    if let Some(chunk) = q.pop() {
                        debug!("simulated playback of {} bytes", chunk.pcm.len());
                    }
                }
            }
        });

        self.running = true;
        Ok(())
    }

    fn enqueue(&self, chunk: AudioChunk) {
        if let Ok(mut q) = self.queue.lock() {
            if q.push(chunk).is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("playback queue full, dropped oldest simulated chunk");
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut q) = self.queue.lock() {
            q.clear();
        }
    }

    async fn stop_playback(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.running = false;
    }

    fn released(&self) -> bool {
        !self.running
    }

    fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the session's source and sink. The physical device is touched by
/// nothing outside this module.
pub struct AudioManager {
    mode: AudioMode,
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
}

impl AudioManager {
    /// Hardware-backed manager. Fails with `DeviceUnavailable` only when a
    /// device cannot be opened at `start`; construction itself is cheap.
    pub fn hardware(
        app_name: &str,
        capture_rate: u32,
        playback_rate: u32,
        chunk_bytes: usize,
        chunk_duration: Duration,
        playback_depth: usize,
    ) -> Self {
        Self {
            mode: AudioMode::Hardware,
            source: Box::new(PulseSource::new(
                app_name,
                capture_rate,
                chunk_bytes,
                chunk_duration,
            )),
            sink: Box::new(PulseSink::new(app_name, playback_rate, playback_depth)),
        }
    }

    pub fn simulated(chunk_bytes: usize, chunk_duration: Duration, playback_depth: usize) -> Self {
        Self {
            mode: AudioMode::Simulated,
            source: Box::new(SimulatedSource::new(chunk_bytes, chunk_duration)),
            sink: Box::new(SimulatedSink::new(playback_depth, chunk_duration)),
        }
    }

    /// Assemble a manager from explicit parts. The seam tests use to stand
    /// in failing or scripted devices.
    pub fn from_parts(mode: AudioMode, source: Box<dyn AudioSource>, sink: Box<dyn AudioSink>) -> Self {
        Self { mode, source, sink }
    }

    pub fn mode(&self) -> AudioMode {
        self.mode
    }

    pub async fn start(&mut self) -> Result<mpsc::Receiver<AudioChunk>> {
        let rx = self.source.start_capture().await?;
        if let Err(e) = self.sink.start_playback().await {
            self.source.stop_capture().await;
            return Err(e);
        }
        Ok(rx)
    }

    pub fn enqueue_playback(&self, chunk: AudioChunk) {
        self.sink.enqueue(chunk);
    }

    pub fn flush_playback(&self) {
        self.sink.flush();
    }

    pub async fn stop(&mut self) {
        self.source.stop_capture().await;
        self.sink.stop_playback().await;
    }

    pub fn released(&self) -> bool {
        self.source.released() && self.sink.released()
    }

    pub fn dropped_playback_chunks(&self) -> u64 {
        self.sink.dropped_chunks()
    }
}

/// Start the preferred manager, dropping to simulated mode when the device
/// is unavailable. The chunk cadence is identical either way, so nothing
/// downstream can tell the difference.
pub async fn start_with_fallback(
    mut primary: AudioManager,
    chunk_bytes: usize,
    chunk_duration: Duration,
    playback_depth: usize,
) -> Result<(AudioManager, mpsc::Receiver<AudioChunk>)> {
    match primary.start().await {
        Ok(rx) => Ok((primary, rx)),
        Err(AudioError::DeviceUnavailable(reason)) => {
            info!("audio device unavailable ({}), running simulated", reason);
            let mut sim = AudioManager::simulated(chunk_bytes, chunk_duration, playback_depth);
            let rx = sim.start().await?;
            Ok((sim, rx))
        }
        Err(e) => Err(e),
    }
}
