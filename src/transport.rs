//! Transport session: one persistent duplex connection to the dialog service
//!
//! Owns the WebSocket for its whole lifecycle: handshake, heartbeats, the
//! bounded outbound queue, inbound reordering and the reconnection policy.
//! Nothing else in the crate touches the socket. The session surfaces
//! decoded traffic as [`TransportEvent`]s and accepts sends that are
//! fire-and-forget from the caller's point of view.
//!
//! Link states: `Disconnected -> Connecting -> Authenticating -> Ready
//! (<-> Degraded) -> Closing -> Disconnected`.

use crate::config::{BridgeConfig, ServiceCredentials};
use crate::events::TransportEvent;
use crate::protocol::{FrameCodec, FrameKind, ProtocolError, SeqCheck, SequenceTracker, VoiceMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("link is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
    Closing,
}

/// The slice of [`BridgeConfig`] the transport needs.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub endpoint: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub reconnect_max_retries: u32,
    pub max_frame_bytes: usize,
    pub reorder_window: usize,
    pub send_queue_depth: usize,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
}

impl From<&BridgeConfig> for LinkConfig {
    fn from(cfg: &BridgeConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            handshake_timeout: cfg.handshake_timeout(),
            heartbeat_interval: cfg.heartbeat_interval(),
            heartbeat_grace: cfg.heartbeat_grace(),
            reconnect_initial_backoff: cfg.reconnect_initial_backoff(),
            reconnect_max_backoff: cfg.reconnect_max_backoff(),
            reconnect_max_retries: cfg.reconnect_max_retries,
            max_frame_bytes: cfg.max_frame_bytes,
            reorder_window: cfg.reorder_window,
            send_queue_depth: cfg.send_queue_depth,
            capture_sample_rate: cfg.capture_sample_rate,
            playback_sample_rate: cfg.playback_sample_rate,
        }
    }
}

/// Exponential backoff schedule, bounded in both delay and attempt count.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    initial: Duration,
    max: Duration,
    retries_left: u32,
    attempt: u32,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial,
            max,
            retries_left: retries,
            attempt: 0,
        }
    }

    /// Next delay, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        let delay = self
            .initial
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt += 1;
        Some(delay)
    }
}

/// Bounded outbound queue. Overflow evicts the oldest un-sent audio chunk;
/// text and control frames are never dropped, so the queue may exceed its
/// depth when only those remain.
#[derive(Debug)]
pub struct SendQueue {
    frames: VecDeque<VoiceMessage>,
    depth: usize,
    dropped_audio: u64,
}

impl SendQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(depth),
            depth,
            dropped_audio: 0,
        }
    }

    /// Returns the audio frame evicted to make room, if any.
    pub fn push(&mut self, frame: VoiceMessage) -> Option<VoiceMessage> {
        let mut evicted = None;
        if self.frames.len() >= self.depth {
            if let Some(pos) = self
                .frames
                .iter()
                .position(|f| f.kind == FrameKind::AudioChunk)
            {
                evicted = self.frames.remove(pos);
                self.dropped_audio += 1;
            }
        }
        self.frames.push_back(frame);
        evicted
    }

    pub fn pop(&mut self) -> Option<VoiceMessage> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped_audio(&self) -> u64 {
        self.dropped_audio
    }
}

/// Reorders inbound frames within a bounded window. Frames that arrive
/// behind the release point are dropped; a backlog wider than the window
/// forces the release point forward past the missing numbers.
#[derive(Debug)]
pub struct ReorderBuffer {
    window: usize,
    next_seq: Option<u32>,
    held: BTreeMap<u32, VoiceMessage>,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            next_seq: None,
            held: BTreeMap::new(),
        }
    }

    pub fn accept(&mut self, frame: VoiceMessage) -> Vec<VoiceMessage> {
        let next = match self.next_seq {
            Some(n) => n,
            None => {
                // First frame anchors the stream.
                self.next_seq = Some(frame.sequence);
                frame.sequence
            }
        };

        if frame.sequence < next {
            warn!(
                "dropping frame seq {} older than release point {}",
                frame.sequence, next
            );
            return Vec::new();
        }

        self.held.insert(frame.sequence, frame);
        let mut released = Vec::new();
        let mut next = next;

        loop {
            if let Some(frame) = self.held.remove(&next) {
                next = next.wrapping_add(1);
                released.push(frame);
                continue;
            }
            // A hole: wait while the backlog fits the window, otherwise
            // abandon the missing numbers and resume at the oldest held.
            if self.held.len() > self.window {
                if let Some((&oldest, _)) = self.held.iter().next() {
                    warn!(
                        "reorder window exceeded, skipping seq {}..{}",
                        next, oldest
                    );
                    next = oldest;
                    continue;
                }
            }
            break;
        }

        self.next_seq = Some(next);
        released
    }
}

/// Commands into the link task.
enum LinkCommand {
    Send(VoiceMessage),
    Close,
}

/// The capability the session adapter programs against. The network
/// transport implements it for production; tests drive the session with a
/// scripted implementation instead.
#[async_trait]
pub trait VoiceLink: Send {
    /// Transmit one agent utterance as a full turn (turn-start, text,
    /// turn-end).
    async fn speak(&mut self, text: &str) -> Result<()>;

    /// Stream one captured audio chunk.
    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<()>;

    /// Ask the remote to abandon the in-flight synthesis.
    async fn send_stop_speaking(&mut self) -> Result<()>;

    /// Next decoded inbound event; `None` once the link is gone.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Graceful teardown. Idempotent.
    async fn close(&mut self);

    fn released(&self) -> bool;
}

/// Production transport over one WebSocket.
///
/// Outbound frames are handed over unsequenced; the link task stamps every
/// frame (including its own heartbeats and re-handshakes) from one
/// monotonic counter so the per-direction ordering invariant holds.
pub struct TransportSession {
    command_tx: mpsc::Sender<LinkCommand>,
    event_rx: mpsc::Receiver<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl TransportSession {
    /// Open the socket, authenticate and spawn the link task. Fails with
    /// `Handshake` on timeout or rejection without leaving anything running.
    pub async fn connect(config: LinkConfig, credentials: ServiceCredentials) -> Result<Self> {
        let codec = FrameCodec::with_max_payload(config.max_frame_bytes);
        info!("connecting to {}", config.endpoint);
        let ws = open_and_authenticate(&config, &credentials, &codec, 0).await?;

        let (command_tx, command_rx) = mpsc::channel::<LinkCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);
        let closed = Arc::new(AtomicBool::new(false));

        let task = LinkTask {
            send_queue: SendQueue::new(config.send_queue_depth),
            reorder: ReorderBuffer::new(config.reorder_window),
            inbound_seq: SequenceTracker::new(),
            state: LinkState::Ready,
            // Sequence 0 went out with the handshake above.
            outbound_seq: 1,
            config,
            credentials,
            codec,
        };
        let closed_flag = closed.clone();
        tokio::spawn(async move {
            task.run(ws, command_rx, event_tx).await;
            closed_flag.store(true, Ordering::Relaxed);
        });

        Ok(Self {
            command_tx,
            event_rx,
            closed,
        })
    }

    async fn enqueue(&mut self, frame: VoiceMessage) -> Result<()> {
        self.command_tx
            .send(LinkCommand::Send(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl VoiceLink for TransportSession {
    async fn speak(&mut self, text: &str) -> Result<()> {
        self.enqueue(VoiceMessage::turn_start(0)).await?;
        self.enqueue(VoiceMessage::text(0, text)).await?;
        self.enqueue(VoiceMessage::turn_end(0)).await
    }

    async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<()> {
        self.enqueue(VoiceMessage::audio(0, pcm)).await
    }

    async fn send_stop_speaking(&mut self) -> Result<()> {
        self.enqueue(VoiceMessage::control(0, b"stop-speaking".to_vec()))
            .await
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    async fn close(&mut self) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.command_tx.send(LinkCommand::Close).await;
        // The link task flips the flag on exit; wait briefly rather than
        // hanging a caller that must always get its resources back.
        for _ in 0..50 {
            if self.closed.load(Ordering::Relaxed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        warn!("link task did not confirm close in time");
        self.closed.store(true, Ordering::Relaxed);
    }

    fn released(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Dial the endpoint and run the application handshake on the fresh socket.
async fn open_and_authenticate(
    config: &LinkConfig,
    credentials: &ServiceCredentials,
    codec: &FrameCodec,
    handshake_seq: u32,
) -> Result<WsStream> {
    debug!(state = ?LinkState::Connecting, "dialing {}", config.endpoint);
    let (mut ws, _) = connect_async(&config.endpoint).await?;
    debug!(state = ?LinkState::Authenticating, "socket open");

    let hello = serde_json::json!({
        "app_id": credentials.app_id,
        "access_token": credentials.access_token,
        "resource_id": credentials.resource_id,
        "connect_id": Uuid::new_v4().to_string(),
        "audio": {
            "format": "pcm_s16le",
            "channels": 1,
            "capture_rate": config.capture_sample_rate,
            "playback_rate": config.playback_sample_rate,
        },
    });
    let frame = VoiceMessage::handshake(handshake_seq, &hello);
    ws.send(Message::Binary(codec.encode(&frame)?.into()))
        .await?;

    // Bounded wait for the matching acknowledgment.
    let deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                let _ = ws.close(None).await;
                return Err(TransportError::Handshake("timed out waiting for acknowledgment".into()));
            }
            msg = ws.next() => {
                let msg = msg.ok_or_else(|| {
                    TransportError::Handshake("socket closed during handshake".into())
                })??;
                let Message::Binary(bytes) = msg else { continue };
                match codec.decode(&bytes) {
                    Ok(frame) if frame.kind == FrameKind::Handshake => {
                        info!("handshake acknowledged");
                        return Ok(ws);
                    }
                    Ok(frame) if frame.kind == FrameKind::Error => {
                        let reason = frame.payload_str().unwrap_or("unspecified").to_string();
                        let _ = ws.close(None).await;
                        return Err(TransportError::Handshake(reason));
                    }
                    Ok(frame) => debug!("ignoring {:?} before handshake ack", frame.kind),
                    Err(e) => warn!("undecodable frame during handshake: {}", e),
                }
            }
        }
    }
}

/// Single task owning the socket. All sends funnel through its queue, all
/// inbound traffic leaves as events.
struct LinkTask {
    config: LinkConfig,
    credentials: ServiceCredentials,
    codec: FrameCodec,
    send_queue: SendQueue,
    reorder: ReorderBuffer,
    inbound_seq: SequenceTracker,
    state: LinkState,
    outbound_seq: u32,
}

impl LinkTask {
    /// Stamp the next outbound sequence and queue the frame.
    fn enqueue_outbound(&mut self, mut frame: VoiceMessage) {
        frame.sequence = self.outbound_seq;
        self.outbound_seq = self.outbound_seq.wrapping_add(1);
        if let Some(evicted) = self.send_queue.push(frame) {
            warn!(
                "send queue full, dropped stale audio seq {} ({} total)",
                evicted.sequence,
                self.send_queue.dropped_audio()
            );
        }
    }

    async fn run(
        mut self,
        mut ws: WsStream,
        mut commands: mpsc::Receiver<LinkCommand>,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut last_inbound = Instant::now();

        info!("link ready");
        loop {
            // Flush before waiting; sends are fire-and-forget upstream.
            if !self.flush(&mut ws).await {
                if !self.reconnect(&mut ws, &events).await {
                    break;
                }
                last_inbound = Instant::now();
                continue;
            }

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Send(frame)) => {
                        self.enqueue_outbound(frame);
                    }
                    Some(LinkCommand::Close) | None => {
                        self.graceful_close(&mut ws).await;
                        break;
                    }
                },
                msg = ws.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        last_inbound = Instant::now();
                        self.handle_frame(&bytes, &events).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("remote closed the socket: {:?}", frame);
                        if !self.reconnect(&mut ws, &events).await {
                            break;
                        }
                        last_inbound = Instant::now();
                    }
                    Some(Ok(other)) => {
                        last_inbound = Instant::now();
                        debug!("ignoring non-binary message: {:?}", other);
                    }
                    Some(Err(e)) => {
                        error!("socket error: {}", e);
                        if !self.reconnect(&mut ws, &events).await {
                            break;
                        }
                        last_inbound = Instant::now();
                    }
                    None => {
                        if !self.reconnect(&mut ws, &events).await {
                            break;
                        }
                        last_inbound = Instant::now();
                    }
                },
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > self.config.heartbeat_grace {
                        warn!(
                            "no inbound traffic for {:?}, link degraded",
                            last_inbound.elapsed()
                        );
                        if !self.reconnect(&mut ws, &events).await {
                            break;
                        }
                        last_inbound = Instant::now();
                    } else {
                        self.enqueue_outbound(VoiceMessage::control(0, b"ping".to_vec()));
                    }
                }
            }
        }

        self.state = LinkState::Disconnected;
        info!("link task finished");
    }

    /// Drain the send queue onto the socket. False means the socket broke.
    async fn flush(&mut self, ws: &mut WsStream) -> bool {
        while let Some(frame) = self.send_queue.pop() {
            let bytes = match self.codec.encode(&frame) {
                Ok(b) => b,
                Err(e) => {
                    // A local framing fault drops the message, not the link.
                    warn!("encode failed, dropping frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws.send(Message::Binary(bytes.into())).await {
                error!("send failed: {}", e);
                return false;
            }
        }
        true
    }

    async fn handle_frame(&mut self, bytes: &[u8], events: &mpsc::Sender<TransportEvent>) {
        let frame = match self.codec.decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                // Malformed frames are logged and dropped; the session
                // continues.
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        match self.inbound_seq.observe(frame.sequence) {
            SeqCheck::Gap { width } => {
                warn!(
                    "inbound sequence gap of {} before seq {} (possible drop)",
                    width, frame.sequence
                );
            }
            SeqCheck::Stale => debug!("stale inbound seq {}", frame.sequence),
            SeqCheck::InOrder => {}
        }

        for frame in self.reorder.accept(frame) {
            if let Some(event) = event_for(frame) {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    /// One reconnection cycle with exponential backoff. True means the link
    /// is ready again; false means retries are exhausted and the fatal
    /// event has been emitted.
    async fn reconnect(&mut self, ws: &mut WsStream, events: &mpsc::Sender<TransportEvent>) -> bool {
        if self.state == LinkState::Closing {
            return false;
        }
        self.state = LinkState::Degraded;
        let _ = events.send(TransportEvent::Degraded).await;

        let mut backoff = BackoffSchedule::new(
            self.config.reconnect_initial_backoff,
            self.config.reconnect_max_backoff,
            self.config.reconnect_max_retries,
        );

        while let Some(delay) = backoff.next_delay() {
            info!("reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
            let handshake_seq = self.outbound_seq;
            self.outbound_seq = self.outbound_seq.wrapping_add(1);
            match open_and_authenticate(&self.config, &self.credentials, &self.codec, handshake_seq)
                .await
            {
                Ok(fresh) => {
                    *ws = fresh;
                    // The remote restarts its sequence space with the new
                    // connection.
                    self.inbound_seq = SequenceTracker::new();
                    self.reorder = ReorderBuffer::new(self.config.reorder_window);
                    self.state = LinkState::Ready;
                    info!("link recovered");
                    let _ = events.send(TransportEvent::Recovered).await;
                    return true;
                }
                Err(e) => warn!("reconnect attempt failed: {}", e),
            }
        }

        error!("reconnection retries exhausted");
        let _ = events.send(TransportEvent::ConnectionLost).await;
        false
    }

    async fn graceful_close(&mut self, ws: &mut WsStream) {
        let was_ready = self.state == LinkState::Ready;
        self.state = LinkState::Closing;
        if was_ready {
            let bye = VoiceMessage::control(self.outbound_seq, b"bye".to_vec());
            self.outbound_seq = self.outbound_seq.wrapping_add(1);
            if let Ok(bytes) = self.codec.encode(&bye) {
                let _ = ws.send(Message::Binary(bytes.into())).await;
            }
        }
        let _ = ws.close(None).await;
        info!("link closed");
    }
}

/// Map a decoded frame to the event the session consumes. Pings and other
/// unrecognized control payloads refresh liveness but carry no event.
fn event_for(frame: VoiceMessage) -> Option<TransportEvent> {
    match frame.kind {
        FrameKind::Handshake => Some(TransportEvent::HandshakeComplete),
        FrameKind::TextChunk => Some(TransportEvent::Text {
            text: frame.payload_str().unwrap_or_default().to_string(),
            sequence: frame.sequence,
        }),
        FrameKind::AudioChunk => Some(TransportEvent::Audio {
            pcm: frame.payload,
            sequence: frame.sequence,
        }),
        FrameKind::TurnStart => Some(TransportEvent::TurnStarted {
            sequence: frame.sequence,
        }),
        FrameKind::TurnEnd => Some(TransportEvent::TurnEnded {
            sequence: frame.sequence,
        }),
        FrameKind::Error => Some(TransportEvent::RemoteError {
            message: frame.payload_str().unwrap_or("unspecified").to_string(),
        }),
        FrameKind::Control => match frame.payload.as_slice() {
            b"flush" => Some(TransportEvent::FlushPlayback),
            _ => None,
        },
    }
}
