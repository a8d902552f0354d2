//! Session state machine over the server's WebSocket channel.
//!
//! Owns the network context: connection lifecycle, the hello handshake,
//! inbound frame dispatch, outbound command flow, and reconnection with
//! exponential backoff. Media frames are decoded here and handed to the
//! jitter buffer; everything observable flows into the state store.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use sendspin_common::{
    ClientMessage, CommandTag, MediaFrame, MetricsContext, PlaybackState, Role, ServerMessage,
    StreamDescriptor, TransportAction,
};

use crate::clock::now_local_us;
use crate::config::PlayerConfig;
use crate::decode::ChunkDecoder;
use crate::error::PlayerError;
use crate::jitter_buffer::JitterBuffer;
use crate::scheduler::AudioCommand;
use crate::state::{ConnectionState, LocalPlayerState, StateStore};
use crate::time_filter::TimeFilter;
use crate::time_probe::ProbeDriver;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel-open and hello-ack deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnection backoff cap.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A server-originated volume within this window suppresses the outbound
/// echo of an identical local change.
const VOLUME_ECHO_WINDOW: Duration = Duration::from_millis(500);

/// External commands accepted by the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Connect { url: String },
    Disconnect,
    Transport(TransportAction),
    SetGroupVolume(u8),
    SetGroupMute(bool),
    SetLocalVolume(u8),
    SetLocalMute(bool),
    Shutdown,
}

/// Cheap cloneable handle driving the session task.
#[derive(Clone)]
pub struct SessionHandle {
    // ---
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    // ---
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        // ---
        Self { tx }
    }

    pub fn connect(&self, url: &str) {
        // ---
        self.send(SessionCommand::Connect {
            url: url.to_string(),
        });
    }

    pub fn disconnect(&self) {
        // ---
        self.send(SessionCommand::Disconnect);
    }

    pub fn transport(&self, action: TransportAction) {
        // ---
        self.send(SessionCommand::Transport(action));
    }

    pub fn set_group_volume(&self, volume: u8) {
        // ---
        self.send(SessionCommand::SetGroupVolume(volume));
    }

    pub fn set_group_mute(&self, muted: bool) {
        // ---
        self.send(SessionCommand::SetGroupMute(muted));
    }

    pub fn set_local_volume(&self, volume: u8) {
        // ---
        self.send(SessionCommand::SetLocalVolume(volume));
    }

    pub fn set_local_mute(&self, muted: bool) {
        // ---
        self.send(SessionCommand::SetLocalMute(muted));
    }

    pub fn shutdown(&self) {
        // ---
        self.send(SessionCommand::Shutdown);
    }

    fn send(&self, cmd: SessionCommand) {
        // ---
        if self.tx.send(cmd).is_err() {
            debug!("session task is gone; command dropped");
        }
    }
}

/// Frames queued to the single writer task.
#[derive(Debug)]
enum Outbound {
    Control(ClientMessage),
    Pong(Vec<u8>),
    Close,
}

/// Why an established connection (or connect attempt loop) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// Transport failed; candidate for reconnection.
    TransportLost,

    /// The user asked to disconnect.
    UserDisconnect,

    /// The whole player is shutting down.
    Shutdown,
}

/// Exponential reconnect delay: 1, 2, 4, 8, 16, then capped at 30 s.
fn reconnect_delay(attempt: u32) -> Duration {
    // ---
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs(1u64 << exp).min(MAX_RECONNECT_DELAY)
}

/// The session task's working state.
pub(crate) struct Session {
    // ---
    config: PlayerConfig,
    state: Arc<StateStore>,
    filter: Arc<Mutex<TimeFilter>>,
    buffer: Arc<Mutex<JitterBuffer>>,
    audio_tx: std_mpsc::Sender<AudioCommand>,
    round_trip_us: Arc<AtomicI64>,
    metrics: Option<MetricsContext>,

    // Per-connection state
    probe: ProbeDriver,
    chunk_decoder: Option<ChunkDecoder>,
    local_volume: u8,
    local_muted: bool,
    last_inbound_volume: Option<(u8, Instant)>,
    last_inbound_mute: Option<(bool, Instant)>,
}

impl Session {
    // ---
    pub(crate) fn new(
        config: PlayerConfig,
        state: Arc<StateStore>,
        filter: Arc<Mutex<TimeFilter>>,
        buffer: Arc<Mutex<JitterBuffer>>,
        audio_tx: std_mpsc::Sender<AudioCommand>,
        round_trip_us: Arc<AtomicI64>,
        metrics: Option<MetricsContext>,
    ) -> Self {
        // ---
        Self {
            config,
            state,
            filter,
            buffer,
            audio_tx,
            round_trip_us,
            metrics,
            probe: ProbeDriver::new(),
            chunk_decoder: None,
            local_volume: 100,
            local_muted: false,
            last_inbound_volume: None,
            last_inbound_mute: None,
        }
    }

    /// Task body: idle until a connect command, then run that connection
    /// (including reconnects) until the user disconnects or shuts down.
    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>) {
        // ---
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SessionCommand::Connect { url } => {
                    if self.run_connection(&url, &mut cmd_rx).await == ConnectionEnd::Shutdown {
                        break;
                    }
                }
                SessionCommand::Shutdown => break,
                SessionCommand::Disconnect => {}
                other => debug!("ignoring command while disconnected: {:?}", other),
            }
        }

        debug!("session task terminated");
    }

    /// Connects to `url`, reconnecting with backoff until the user stops it.
    async fn run_connection(
        &mut self,
        url: &str,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> ConnectionEnd {
        // ---
        let mut attempt: u32 = 0;

        loop {
            self.state.set_connection(ConnectionState::Connecting);
            self.reset_connection_state();

            let mut established = false;
            match self.connect_once(url, cmd_rx, &mut established).await {
                Ok(ConnectionEnd::UserDisconnect) => {
                    info!("disconnected by request");
                    self.reset_all();
                    return ConnectionEnd::UserDisconnect;
                }
                Ok(ConnectionEnd::Shutdown) => {
                    self.reset_all();
                    return ConnectionEnd::Shutdown;
                }
                Ok(ConnectionEnd::TransportLost) => {
                    warn!("connection to {} lost", url);
                }
                Err(PlayerError::HelloRejected(reason)) => {
                    error!("server rejected hello: {}", reason);
                    self.state.set_connection(ConnectionState::Error);
                    self.reset_all();
                    return ConnectionEnd::UserDisconnect;
                }
                Err(e) => {
                    warn!("connection to {} failed: {}", url, e);
                }
            }

            // A fresh outage after an established session restarts the
            // backoff ladder.
            if established {
                attempt = 0;
            }
            attempt += 1;

            if let Some(metrics) = &self.metrics {
                metrics.reconnects_total.inc();
            }

            self.state.set_connection(ConnectionState::Error);
            let delay = reconnect_delay(attempt);
            info!("reconnecting in {:?} (attempt {})", delay, attempt);

            match wait_for_retry(cmd_rx, delay).await {
                RetryWait::Retry => {
                    self.state.set_connection(ConnectionState::Disconnected);
                }
                RetryWait::Disconnect => {
                    self.reset_all();
                    return ConnectionEnd::UserDisconnect;
                }
                RetryWait::Shutdown => {
                    self.reset_all();
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }

    /// One connection attempt: open, handshake, then the connected loop.
    async fn connect_once(
        &mut self,
        url: &str,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
        established: &mut bool,
    ) -> Result<ConnectionEnd, PlayerError> {
        // ---
        info!("connecting to {}", url);

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| PlayerError::Transport("channel open timed out".to_string()))?
            .map_err(|e| PlayerError::Transport(format!("failed to connect: {e}")))?;

        let (write, mut read) = ws.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(write, out_rx));

        let _ = out_tx.send(Outbound::Control(ClientMessage::Hello {
            client_id: self.config.client_id.clone(),
            client_name: self.config.client_name.clone(),
            roles: vec![Role::Player],
        }));

        let ack = tokio::time::timeout(CONNECT_TIMEOUT, wait_for_hello_ack(&mut read))
            .await
            .map_err(|_| PlayerError::Transport("hello_ack timed out".to_string()))??;

        info!(
            "session established: group '{}', {} supported commands",
            ack.group_name,
            ack.supported_commands.len()
        );

        *established = true;
        self.state.set_connection(ConnectionState::Connected);

        if let Some(descriptor) = ack.stream {
            self.apply_stream(descriptor);
        }

        let end = self.connected_loop(&mut read, &out_tx, cmd_rx).await;

        if matches!(
            end,
            ConnectionEnd::UserDisconnect | ConnectionEnd::Shutdown
        ) {
            // Polite close; the writer drains its queue before exiting.
            let _ = out_tx.send(Outbound::Close);
        }

        Ok(end)
    }

    /// Steady-state select loop over commands, inbound frames, and the probe
    /// timer.
    async fn connected_loop(
        &mut self,
        read: &mut SplitStream<WsStream>,
        out_tx: &mpsc::UnboundedSender<Outbound>,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> ConnectionEnd {
        // ---
        let mut probe_period = ProbeDriver::interval(&self.filter.lock());
        let mut probe_timer = tokio::time::interval(probe_period);
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else {
                        return ConnectionEnd::Shutdown;
                    };
                    if let Some(end) = self.handle_command(cmd, out_tx) {
                        return end;
                    }
                }

                maybe_frame = read.next() => {
                    match maybe_frame {
                        None => {
                            warn!("channel closed by server");
                            return ConnectionEnd::TransportLost;
                        }
                        Some(Err(e)) => {
                            warn!("transport error: {}", e);
                            return ConnectionEnd::TransportLost;
                        }
                        Some(Ok(Message::Text(text))) => self.dispatch_control(&text, out_tx),
                        Some(Ok(Message::Binary(data))) => self.dispatch_media(&data),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = out_tx.send(Outbound::Pong(payload));
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("server closed the channel");
                            return ConnectionEnd::TransportLost;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                _ = probe_timer.tick() => {
                    let msg = self.probe.begin(now_local_us());
                    let _ = out_tx.send(Outbound::Control(msg));
                    if let Some(metrics) = &self.metrics {
                        metrics.probes_sent_total.inc();
                    }

                    // Back off to the slow cadence once converged.
                    let desired = ProbeDriver::interval(&self.filter.lock());
                    if desired != probe_period {
                        probe_period = desired;
                        probe_timer = tokio::time::interval_at(
                            tokio::time::Instant::now() + desired,
                            desired,
                        );
                        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
    }

    /// Handles one external command while connected. Returns the connection
    /// end when the command terminates it.
    fn handle_command(
        &mut self,
        cmd: SessionCommand,
        out_tx: &mpsc::UnboundedSender<Outbound>,
    ) -> Option<ConnectionEnd> {
        // ---
        match cmd {
            SessionCommand::Disconnect => return Some(ConnectionEnd::UserDisconnect),
            SessionCommand::Shutdown => return Some(ConnectionEnd::Shutdown),
            SessionCommand::Connect { url } => {
                warn!("already connected; ignoring connect to {}", url);
            }
            SessionCommand::Transport(action) => {
                let _ = out_tx.send(Outbound::Control(ClientMessage::Cmd { action }));
            }
            SessionCommand::SetGroupVolume(volume) => {
                let _ = out_tx.send(Outbound::Control(ClientMessage::GroupVolume {
                    volume: volume.min(100),
                }));
            }
            SessionCommand::SetGroupMute(muted) => {
                let _ = out_tx.send(Outbound::Control(ClientMessage::GroupMute { muted }));
            }
            SessionCommand::SetLocalVolume(volume) => self.set_local_volume(volume, out_tx),
            SessionCommand::SetLocalMute(muted) => self.set_local_mute(muted, out_tx),
        }
        None
    }

    /// Applies a local volume change and reports it, unless it merely echoes
    /// a recent server command.
    fn set_local_volume(&mut self, volume: u8, out_tx: &mpsc::UnboundedSender<Outbound>) {
        // ---
        let volume = volume.min(100);
        self.local_volume = volume;
        let _ = self.audio_tx.send(AudioCommand::SetVolume(volume));
        self.publish_local_player(false);

        let echo = matches!(
            self.last_inbound_volume,
            Some((v, at)) if v == volume && at.elapsed() < VOLUME_ECHO_WINDOW
        );
        if !echo {
            let _ = out_tx.send(Outbound::Control(ClientMessage::LocalVolume { volume }));
        }
    }

    fn set_local_mute(&mut self, muted: bool, out_tx: &mpsc::UnboundedSender<Outbound>) {
        // ---
        self.local_muted = muted;
        let _ = self.audio_tx.send(AudioCommand::SetMuted(muted));
        self.publish_local_player(false);

        let echo = matches!(
            self.last_inbound_mute,
            Some((m, at)) if m == muted && at.elapsed() < VOLUME_ECHO_WINDOW
        );
        if !echo {
            let _ = out_tx.send(Outbound::Control(ClientMessage::LocalMute { muted }));
        }
    }

    fn publish_local_player(&self, from_server: bool) {
        // ---
        self.state.set_local_player(LocalPlayerState {
            volume: self.local_volume,
            muted: self.local_muted,
            from_server,
        });
    }

    /// Routes one inbound JSON control frame.
    fn dispatch_control(&mut self, text: &str, out_tx: &mpsc::UnboundedSender<Outbound>) {
        // ---
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed control frame: {}", e);
                return;
            }
        };

        match msg {
            ServerMessage::TimeProbeResponse { t0_us, s1_us, s2_us } => {
                let now = now_local_us();
                let accepted = {
                    let mut filter = self.filter.lock();
                    self.probe.on_response(t0_us, s1_us, s2_us, now, &mut filter)
                };
                if accepted {
                    if let Some(rtt) = self.probe.last_round_trip_us() {
                        self.round_trip_us.store(rtt, Ordering::Relaxed);
                        if let Some(metrics) = &self.metrics {
                            metrics.probe_responses_total.inc();
                            metrics.probe_rtt_seconds.observe(rtt as f64 / 1e6);
                        }
                    }
                }
            }

            ServerMessage::Stream { descriptor } => self.apply_stream(descriptor),

            ServerMessage::Metadata { metadata } => {
                self.state.set_metadata(Some(metadata));
            }

            ServerMessage::Controller { state } => {
                self.state.set_controller(Some(state));
            }

            ServerMessage::PlayerVolume { volume } => {
                let volume = volume.min(100);
                self.last_inbound_volume = Some((volume, Instant::now()));
                self.local_volume = volume;
                let _ = self.audio_tx.send(AudioCommand::SetVolume(volume));
                self.publish_local_player(true);
            }

            ServerMessage::PlayerMute { muted } => {
                self.last_inbound_mute = Some((muted, Instant::now()));
                self.local_muted = muted;
                let _ = self.audio_tx.send(AudioCommand::SetMuted(muted));
                self.publish_local_player(true);
            }

            ServerMessage::Ping => {
                let _ = out_tx.send(Outbound::Control(ClientMessage::Pong));
            }

            ServerMessage::HelloAck { .. } => {
                debug!("unexpected hello_ack after handshake; ignoring");
            }
        }
    }

    /// Routes one inbound binary media frame into the jitter buffer.
    fn dispatch_media(&mut self, data: &[u8]) {
        // ---
        let frame = match MediaFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed media frame: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.chunks_dropped_total.inc();
                }
                return;
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.chunks_received_total.inc();
        }

        let Some(decoder) = self.chunk_decoder.as_mut() else {
            debug!("no usable decoder for the active stream; dropping media frame");
            return;
        };

        let start = Instant::now();
        let decoded = decoder.decode_frame(&frame);
        if let Some(metrics) = &self.metrics {
            metrics.decode_seconds.observe(start.elapsed().as_secs_f64());
        }

        match decoded {
            Ok(decoded_frame) => {
                let server_now = self.filter.lock().client_to_server(now_local_us());
                let mut buffer = self.buffer.lock();

                let late_before = buffer.late_drops();
                let dup_before = buffer.duplicate_drops();
                buffer.insert(decoded_frame, server_now);

                if let Some(metrics) = &self.metrics {
                    if buffer.late_drops() > late_before {
                        metrics.chunks_late_total.inc();
                    }
                    if buffer.duplicate_drops() > dup_before {
                        metrics.chunks_duplicate_total.inc();
                    }
                }
            }
            Err(e @ PlayerError::StreamFormatMismatch { .. }) => {
                warn!("{}; awaiting next stream descriptor", e);
                if let Some(metrics) = &self.metrics {
                    metrics.chunks_dropped_total.inc();
                }
            }
            Err(e) => {
                warn!("chunk decode failed: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.chunks_dropped_total.inc();
                }
            }
        }
    }

    /// Installs a new stream descriptor: decoder, sink format, transport
    /// state.
    fn apply_stream(&mut self, descriptor: StreamDescriptor) {
        // ---
        info!(
            "stream: {} {}Hz {}ch {}bit, {:?} in group '{}'",
            descriptor.codec,
            descriptor.sample_rate,
            descriptor.channels,
            descriptor.bit_depth,
            descriptor.playback_state,
            descriptor.group_name
        );

        match ChunkDecoder::new(&descriptor) {
            Ok(decoder) => self.chunk_decoder = Some(decoder),
            Err(e) => {
                warn!("cannot decode this stream: {}", e);
                self.chunk_decoder = None;
            }
        }

        let _ = self
            .audio_tx
            .send(AudioCommand::Configure(descriptor.clone()));

        match descriptor.playback_state {
            PlaybackState::Playing => {
                let _ = self.audio_tx.send(AudioCommand::Resume);
            }
            PlaybackState::Paused => {
                let _ = self.audio_tx.send(AudioCommand::Pause);
            }
            PlaybackState::Stopped | PlaybackState::Idle => {
                let _ = self.audio_tx.send(AudioCommand::Pause);
                self.buffer.lock().clear();
            }
        }

        self.state.set_stream(Some(descriptor));
    }

    /// Clears the per-connection working state (new attempt, teardown).
    fn reset_connection_state(&mut self) {
        // ---
        self.probe.clear();
        self.chunk_decoder = None;
        self.last_inbound_volume = None;
        self.last_inbound_mute = None;
        self.buffer.lock().reset();
        self.filter.lock().reset();
        self.round_trip_us.store(0, Ordering::Relaxed);
        let _ = self.audio_tx.send(AudioCommand::Pause);
    }

    /// Full teardown back to the initial observable snapshot.
    fn reset_all(&mut self) {
        // ---
        self.reset_connection_state();
        self.local_volume = 100;
        self.local_muted = false;
        self.state.reset_observables();
        self.state.set_connection(ConnectionState::Disconnected);
    }
}

/// Data carried by the server's handshake acceptance.
struct HelloAck {
    group_name: String,
    supported_commands: Vec<CommandTag>,
    stream: Option<StreamDescriptor>,
}

/// Reads frames until the hello acknowledgement arrives.
///
/// A close during the handshake is a rejection: fatal for these credentials,
/// no automatic reconnect.
async fn wait_for_hello_ack(read: &mut SplitStream<WsStream>) -> Result<HelloAck, PlayerError> {
    // ---
    while let Some(frame) = read.next().await {
        let frame = frame.map_err(|e| PlayerError::Transport(format!("handshake failed: {e}")))?;

        match frame {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::HelloAck {
                    group_name,
                    supported_commands,
                    stream,
                }) => {
                    return Ok(HelloAck {
                        group_name,
                        supported_commands,
                        stream,
                    });
                }
                Ok(other) => debug!("ignoring pre-handshake frame: {:?}", other),
                Err(e) => warn!("dropping malformed handshake frame: {}", e),
            },
            Message::Close(reason) => {
                let reason = reason
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed during handshake".to_string());
                return Err(PlayerError::HelloRejected(reason));
            }
            _ => {}
        }
    }

    Err(PlayerError::Transport(
        "channel closed during handshake".to_string(),
    ))
}

/// Writer task: the single writer for this channel.
async fn writer_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    // ---
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Control(control) => match serde_json::to_string(&control) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    error!("failed to encode control frame: {}", e);
                    continue;
                }
            },
            Outbound::Pong(payload) => Message::Pong(payload),
            Outbound::Close => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = write.send(msg).await {
            error!("failed to send frame: {}", e);
            break;
        }
    }

    debug!("writer task terminated");
}

/// Outcome of waiting out a reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryWait {
    Retry,
    Disconnect,
    Shutdown,
}

/// Sleeps for `delay`, unless the user disconnects or shuts down first.
async fn wait_for_retry(
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    delay: Duration,
) -> RetryWait {
    // ---
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return RetryWait::Retry,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(SessionCommand::Shutdown) => return RetryWait::Shutdown,
                Some(SessionCommand::Disconnect) => return RetryWait::Disconnect,
                Some(other) => debug!("ignoring command during backoff: {:?}", other),
            }
        }
    }
}
