//! Observable state store.
//!
//! Holds the latest snapshot of every externally visible aspect of the
//! player. Observers subscribe to a slot and receive the current value
//! immediately plus every subsequent distinct value; duplicate writes are
//! swallowed so notification sequences stay monotonic.

use tokio::sync::watch;

use sendspin_common::{ControllerState, Metadata, StreamDescriptor};

/// Connection lifecycle of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Buffer and clock health, published by the playout scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStats {
    // ---
    /// Chunks currently queued in the jitter buffer.
    pub queued_chunks: usize,

    /// Milliseconds of audio buffered past the playout point.
    pub buffer_ahead_ms: i64,

    /// Chunks that missed their playout deadline.
    pub late_drops: u64,

    /// Estimated server-minus-client clock offset (µs).
    pub clock_offset_us: i64,

    /// Estimated clock drift in parts per million.
    pub clock_drift_ppm: f64,

    /// Last accepted probe round trip (µs).
    pub round_trip_us: i64,

    /// Whether playout is allowed to run.
    pub clock_converged: bool,

    /// Measurements applied to the clock filter.
    pub clock_measurements: u32,

    /// Standard error of the clock offset (µs); `i64::MAX` before the first
    /// measurement.
    pub clock_error_us: i64,
}

impl Default for BufferStats {
    fn default() -> Self {
        // ---
        Self {
            queued_chunks: 0,
            buffer_ahead_ms: 0,
            late_drops: 0,
            clock_offset_us: 0,
            clock_drift_ppm: 0.0,
            round_trip_us: 0,
            clock_converged: false,
            clock_measurements: 0,
            clock_error_us: i64::MAX,
        }
    }
}

/// This player's local volume as last applied to the platform sink.
///
/// `from_server` marks changes that originated in a server command so the UI
/// layer can skip echoing them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPlayerState {
    // ---
    pub volume: u8,
    pub muted: bool,
    pub from_server: bool,
}

impl Default for LocalPlayerState {
    fn default() -> Self {
        // ---
        Self {
            volume: 100,
            muted: false,
            from_server: false,
        }
    }
}

/// Fan-out store for player state snapshots.
///
/// Writes are cheap synchronous swaps; observers never block the writer.
pub struct StateStore {
    // ---
    connection: watch::Sender<ConnectionState>,
    stream: watch::Sender<Option<StreamDescriptor>>,
    metadata: watch::Sender<Option<Metadata>>,
    buffer: watch::Sender<BufferStats>,
    controller: watch::Sender<Option<ControllerState>>,
    local_player: watch::Sender<LocalPlayerState>,
}

impl StateStore {
    // ---
    /// Creates a store with every slot at its initial value.
    pub fn new() -> Self {
        // ---
        Self {
            connection: watch::channel(ConnectionState::default()).0,
            stream: watch::channel(None).0,
            metadata: watch::channel(None).0,
            buffer: watch::channel(BufferStats::default()).0,
            controller: watch::channel(None).0,
            local_player: watch::channel(LocalPlayerState::default()).0,
        }
    }

    /// Resets every observable slot except the connection state.
    ///
    /// The connection slot is owned by the session's transition logic, which
    /// calls [`Self::set_connection`] explicitly.
    pub fn reset_observables(&self) {
        // ---
        Self::swap(&self.stream, None);
        Self::swap(&self.metadata, None);
        Self::swap(&self.buffer, BufferStats::default());
        Self::swap(&self.controller, None);
        Self::swap(&self.local_player, LocalPlayerState::default());
    }

    pub fn set_connection(&self, value: ConnectionState) {
        // ---
        Self::swap(&self.connection, value);
    }

    pub fn set_stream(&self, value: Option<StreamDescriptor>) {
        // ---
        Self::swap(&self.stream, value);
    }

    pub fn set_metadata(&self, value: Option<Metadata>) {
        // ---
        Self::swap(&self.metadata, value);
    }

    pub fn set_buffer_stats(&self, value: BufferStats) {
        // ---
        Self::swap(&self.buffer, value);
    }

    pub fn set_controller(&self, value: Option<ControllerState>) {
        // ---
        Self::swap(&self.controller, value);
    }

    pub fn set_local_player(&self, value: LocalPlayerState) {
        // ---
        Self::swap(&self.local_player, value);
    }

    /// Current connection state.
    pub fn connection(&self) -> ConnectionState {
        // ---
        *self.connection.borrow()
    }

    /// Current buffer stats snapshot.
    pub fn buffer_stats(&self) -> BufferStats {
        // ---
        self.buffer.borrow().clone()
    }

    /// Current local volume snapshot.
    pub fn local_player(&self) -> LocalPlayerState {
        // ---
        *self.local_player.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        // ---
        self.connection.subscribe()
    }

    pub fn subscribe_stream(&self) -> watch::Receiver<Option<StreamDescriptor>> {
        // ---
        self.stream.subscribe()
    }

    pub fn subscribe_metadata(&self) -> watch::Receiver<Option<Metadata>> {
        // ---
        self.metadata.subscribe()
    }

    pub fn subscribe_buffer_stats(&self) -> watch::Receiver<BufferStats> {
        // ---
        self.buffer.subscribe()
    }

    pub fn subscribe_controller(&self) -> watch::Receiver<Option<ControllerState>> {
        // ---
        self.controller.subscribe()
    }

    pub fn subscribe_local_player(&self) -> watch::Receiver<LocalPlayerState> {
        // ---
        self.local_player.subscribe()
    }

    /// Publishes only when the value actually changed, keeping every
    /// observer's sequence a subsequence of distinct writes.
    fn swap<T: PartialEq>(slot: &watch::Sender<T>, value: T) {
        // ---
        slot.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        // ---
        Self::new()
    }
}
