//! Sendspin synchronized audio player.
//!
//! Client runtime for the Sendspin multi-room streaming protocol: clock
//! synchronization against the server, a jitter-buffered playout path that
//! releases audio sample-accurately across every player in a group, and the
//! session machinery around them. This library can be used to build custom
//! players or for integration testing; the `sendspin-player` binary wires it
//! to cpal and mDNS discovery.

pub mod audio;
pub mod autoconnect;
pub mod clock;
pub mod config;
pub mod decode;
pub mod discovery;
pub mod error;
pub mod jitter_buffer;
pub mod recent_servers;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod time_filter;
pub mod time_probe;

pub use audio::{AudioSink, CpalSink, NullSink};
pub use autoconnect::{AutoConnectPolicy, ConnectMode, SessionControl};
pub use config::PlayerConfig;
pub use decode::{ChunkDecoder, DecodedFrame};
pub use discovery::{DiscoveryAdapter, DiscoveryEvent, ServerInfo};
pub use error::PlayerError;
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig};
pub use recent_servers::{MemoryRecentServers, RecentServer, RecentServersStore};
pub use scheduler::SinkFactory;
pub use session::SessionHandle;
pub use state::{BufferStats, ConnectionState, LocalPlayerState, StateStore};
pub use time_filter::TimeFilter;

use parking_lot::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use sendspin_common::{MetricsContext, TransportAction};

use crate::scheduler::AudioCommand;
use crate::session::Session;

/// A running Sendspin player.
///
/// Owns the three execution contexts: the session task (network), the playout
/// thread (audio), and this handle's synchronous API (control). Must be
/// created inside a tokio runtime.
pub struct Player {
    // ---
    handle: SessionHandle,
    state: Arc<StateStore>,
    filter: Arc<Mutex<TimeFilter>>,
    audio_tx: std_mpsc::Sender<AudioCommand>,
    audio_thread: Option<JoinHandle<()>>,
}

impl Player {
    // ---
    /// Starts a player without metrics.
    pub fn new(config: PlayerConfig, sink_factory: SinkFactory) -> Result<Self, PlayerError> {
        // ---
        Self::start(config, sink_factory, None)
    }

    /// Starts a player reporting into `metrics`.
    pub fn with_metrics(
        config: PlayerConfig,
        sink_factory: SinkFactory,
        metrics: MetricsContext,
    ) -> Result<Self, PlayerError> {
        // ---
        Self::start(config, sink_factory, Some(metrics))
    }

    fn start(
        config: PlayerConfig,
        sink_factory: SinkFactory,
        metrics: Option<MetricsContext>,
    ) -> Result<Self, PlayerError> {
        // ---
        let state = Arc::new(StateStore::new());
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let buffer = Arc::new(Mutex::new(JitterBuffer::new(JitterBufferConfig {
            max_queued: config.max_queued,
            playout_offset_us: config.playout_offset_us(),
        })));
        let round_trip_us = Arc::new(AtomicI64::new(0));

        let (audio_thread, audio_tx) = scheduler::spawn(
            Arc::clone(&filter),
            Arc::clone(&buffer),
            Arc::clone(&state),
            Arc::clone(&round_trip_us),
            metrics.clone(),
            sink_factory,
        )?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            config,
            Arc::clone(&state),
            Arc::clone(&filter),
            buffer,
            audio_tx.clone(),
            round_trip_us,
            metrics,
        );
        tokio::spawn(session.run(cmd_rx));

        Ok(Self {
            handle: SessionHandle::new(cmd_tx),
            state,
            filter,
            audio_tx,
            audio_thread: Some(audio_thread),
        })
    }

    /// Connects to a server WebSocket URL.
    pub fn connect(&self, url: &str) {
        // ---
        self.handle.connect(url);
    }

    /// Disconnects and resets all observable state.
    pub fn disconnect(&self) {
        // ---
        self.handle.disconnect();
    }

    pub fn play(&self) {
        // ---
        self.handle.transport(TransportAction::Play);
    }

    pub fn pause(&self) {
        // ---
        self.handle.transport(TransportAction::Pause);
    }

    pub fn stop(&self) {
        // ---
        self.handle.transport(TransportAction::Stop);
    }

    pub fn next(&self) {
        // ---
        self.handle.transport(TransportAction::Next);
    }

    pub fn previous(&self) {
        // ---
        self.handle.transport(TransportAction::Previous);
    }

    pub fn set_group_volume(&self, volume: u8) {
        // ---
        self.handle.set_group_volume(volume);
    }

    pub fn set_group_mute(&self, muted: bool) {
        // ---
        self.handle.set_group_mute(muted);
    }

    pub fn set_local_volume(&self, volume: u8) {
        // ---
        self.handle.set_local_volume(volume);
    }

    pub fn set_local_mute(&self, muted: bool) {
        // ---
        self.handle.set_local_mute(muted);
    }

    /// Cloneable session handle (e.g. for the auto-connect policy).
    pub fn handle(&self) -> SessionHandle {
        // ---
        self.handle.clone()
    }

    /// The observable state store.
    pub fn state(&self) -> Arc<StateStore> {
        // ---
        Arc::clone(&self.state)
    }

    /// Live track position extrapolated to the current server time.
    ///
    /// Returns `Ok(None)` when no metadata (or no progress) is available.
    ///
    /// # Errors
    ///
    /// [`PlayerError::ClockUnready`] until the time filter has enough
    /// measurements to convert timestamps.
    pub fn track_position_ms(&self) -> Result<Option<i64>, PlayerError> {
        // ---
        let server_now = self
            .filter
            .lock()
            .client_to_server(clock::now_local_us())
            .ok_or(PlayerError::ClockUnready)?;

        Ok(self
            .state
            .subscribe_metadata()
            .borrow()
            .as_ref()
            .and_then(|metadata| metadata.position_ms_at(server_now)))
    }

    /// Tears every context down and waits for the audio thread.
    pub fn release(&mut self) {
        // ---
        self.handle.shutdown();
        let _ = self.audio_tx.send(AudioCommand::Shutdown);

        if let Some(thread) = self.audio_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        // ---
        // Signal both contexts; release() additionally joins the audio
        // thread for a deterministic teardown.
        self.handle.shutdown();
        let _ = self.audio_tx.send(AudioCommand::Shutdown);
    }
}
