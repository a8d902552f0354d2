//! Playout scheduler.
//!
//! The audio context: a dedicated thread that ticks every 5 ms, converts the
//! local clock into the server domain, and drains due frames from the jitter
//! buffer into the sink. While the clock filter has not converged the sink is
//! held paused and the buffer fills without draining; releasing audio against
//! an estimate that is still jumping would be audible on every client.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use sendspin_common::{MetricsContext, StreamDescriptor};

use crate::audio::AudioSink;
use crate::clock::now_local_us;
use crate::error::PlayerError;
use crate::jitter_buffer::JitterBuffer;
use crate::state::{BufferStats, StateStore};
use crate::time_filter::TimeFilter;

/// Nominal playout tick. The OS may add jitter in either direction; the
/// release condition is pure clock arithmetic, so a slow tick only batches
/// frames, never reorders them.
pub const TICK: Duration = Duration::from_millis(5);

/// Publish a `BufferStats` snapshot every this many ticks (~100 ms).
const STATS_PUBLISH_EVERY: u32 = 20;

/// Cadence of the one-line stats log.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Commands from the session (control/network contexts) to the audio thread.
#[derive(Debug)]
pub enum AudioCommand {
    /// Open the sink for a new stream format.
    Configure(StreamDescriptor),

    /// Allow playout (transport is playing).
    Resume,

    /// Halt playout (transport paused/stopped, or disconnecting).
    Pause,

    /// Apply a local volume, 0-100.
    SetVolume(u8),

    /// Apply a local mute flag.
    SetMuted(bool),

    /// Tear the audio thread down.
    Shutdown,
}

/// Constructs the sink on the audio thread itself; platform stream handles
/// are not `Send`.
pub type SinkFactory = Box<dyn FnOnce() -> Box<dyn AudioSink> + Send>;

/// Spawns the audio thread.
///
/// Returns the thread handle plus the command channel the session uses to
/// drive the sink.
pub fn spawn(
    filter: Arc<Mutex<TimeFilter>>,
    buffer: Arc<Mutex<JitterBuffer>>,
    state: Arc<StateStore>,
    round_trip_us: Arc<AtomicI64>,
    metrics: Option<MetricsContext>,
    sink_factory: SinkFactory,
) -> Result<(JoinHandle<()>, Sender<AudioCommand>), PlayerError> {
    // ---
    let (tx, rx) = std::sync::mpsc::channel();

    let handle = std::thread::Builder::new()
        .name("sendspin-audio".to_string())
        .spawn(move || {
            let scheduler = PlayoutScheduler::new(
                filter,
                buffer,
                state,
                round_trip_us,
                metrics,
                sink_factory(),
            );
            scheduler.run(rx);
        })
        .map_err(|e| PlayerError::Audio(format!("failed to spawn audio thread: {e}")))?;

    Ok((handle, tx))
}

/// Drives frame release and stats publication.
struct PlayoutScheduler {
    // ---
    filter: Arc<Mutex<TimeFilter>>,
    buffer: Arc<Mutex<JitterBuffer>>,
    state: Arc<StateStore>,
    round_trip_us: Arc<AtomicI64>,
    metrics: Option<MetricsContext>,
    sink: Box<dyn AudioSink>,

    /// Transport-level pause, independent of the convergence gate.
    transport_paused: bool,

    ticks: u32,
    last_log: Instant,
    last_stats: BufferStats,
}

impl PlayoutScheduler {
    // ---
    fn new(
        filter: Arc<Mutex<TimeFilter>>,
        buffer: Arc<Mutex<JitterBuffer>>,
        state: Arc<StateStore>,
        round_trip_us: Arc<AtomicI64>,
        metrics: Option<MetricsContext>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        // ---
        Self {
            filter,
            buffer,
            state,
            round_trip_us,
            metrics,
            sink,
            transport_paused: true,
            ticks: 0,
            last_log: Instant::now(),
            last_stats: BufferStats::default(),
        }
    }

    /// Thread body: commands preempt the tick; quiet periods tick on time.
    fn run(mut self, rx: Receiver<AudioCommand>) {
        // ---
        info!("playout scheduler running");

        loop {
            match rx.recv_timeout(TICK) {
                Ok(AudioCommand::Shutdown) => break,
                Ok(cmd) => self.handle_command(cmd),
                Err(RecvTimeoutError::Timeout) => self.tick(now_local_us()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.sink.close();
        debug!("playout scheduler stopped");
    }

    fn handle_command(&mut self, cmd: AudioCommand) {
        // ---
        match cmd {
            AudioCommand::Configure(descriptor) => {
                if let Err(e) = self.sink.open(
                    descriptor.sample_rate,
                    descriptor.channels,
                    descriptor.bit_depth,
                ) {
                    warn!("audio open failed: {}", e);
                }
            }
            AudioCommand::Resume => {
                self.transport_paused = false;
            }
            AudioCommand::Pause => {
                self.transport_paused = true;
                self.sink.pause();
            }
            AudioCommand::SetVolume(volume) => self.sink.set_volume(volume),
            AudioCommand::SetMuted(muted) => self.sink.set_muted(muted),
            // Intercepted by the run loop.
            AudioCommand::Shutdown => {}
        }
    }

    /// One playout tick at local time `now_local_us`.
    fn tick(&mut self, now_local_us: i64) {
        // ---
        let (server_now, converged) = {
            let filter = self.filter.lock();
            (filter.client_to_server(now_local_us), filter.has_converged())
        };

        match server_now {
            Some(now) if converged && !self.transport_paused => {
                self.sink.resume();
                self.drain(now);
            }
            _ => {
                // Pre-convergence gate, or nothing to play: keep the device
                // quiet while the buffer fills.
                self.sink.pause();
            }
        }

        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % STATS_PUBLISH_EVERY == 0 {
            self.publish_stats(now_local_us);
        }
        if self.last_log.elapsed() >= STATS_LOG_INTERVAL {
            self.log_stats();
            self.last_log = Instant::now();
        }
    }

    /// Writes every due frame to the sink, dropping frames that already
    /// ended.
    fn drain(&mut self, server_now_us: i64) {
        // ---
        loop {
            let frame = {
                let mut buffer = self.buffer.lock();
                buffer.pop_due(server_now_us)
            };

            let Some(frame) = frame else {
                break;
            };

            if frame.presentation_ts_us + frame.duration_us < server_now_us {
                self.buffer.lock().mark_late_release();
                if let Some(metrics) = &self.metrics {
                    metrics.chunks_late_total.inc();
                }
                continue;
            }

            self.sink.write(&frame.pcm);
        }
    }

    fn publish_stats(&mut self, now_local_us: i64) {
        // ---
        let (server_now, offset, drift_ppm, error, measurements, converged) = {
            let filter = self.filter.lock();
            (
                filter.client_to_server(now_local_us),
                filter.estimated_offset_us(),
                filter.estimated_drift_ppm(),
                filter.estimated_error_us(),
                filter.measurements(),
                filter.has_converged(),
            )
        };

        let (queued, ahead_ms, late) = {
            let buffer = self.buffer.lock();
            let ahead = server_now
                .map(|now| buffer.buffer_ahead_ms(now))
                .unwrap_or(0);
            (buffer.queued_chunks(), ahead, buffer.late_drops())
        };

        let stats = BufferStats {
            queued_chunks: queued,
            buffer_ahead_ms: ahead_ms,
            late_drops: late,
            clock_offset_us: offset.round() as i64,
            clock_drift_ppm: drift_ppm,
            round_trip_us: self.round_trip_us.load(Ordering::Relaxed),
            clock_converged: converged,
            clock_measurements: measurements,
            clock_error_us: if error.is_finite() {
                error.round() as i64
            } else {
                i64::MAX
            },
        };

        if let Some(metrics) = &self.metrics {
            metrics.jitter_buffer_occupancy_chunks.set(queued as i64);
            metrics.buffer_ahead_ms.set(ahead_ms);
            metrics.clock_offset_us.set(stats.clock_offset_us as f64);
            if error.is_finite() {
                metrics.clock_error_us.set(error);
            }
        }

        self.state.set_buffer_stats(stats.clone());
        self.last_stats = stats;
    }

    fn log_stats(&self) {
        // ---
        let s = &self.last_stats;
        info!(
            "playout: {} queued, {}ms ahead, {} late, clock offset={}us drift={:.1}ppm err={}us ({})",
            s.queued_chunks,
            s.buffer_ahead_ms,
            s.late_drops,
            s.clock_offset_us,
            s.clock_drift_ppm,
            s.clock_error_us,
            if s.clock_converged { "converged" } else { "converging" },
        );
    }
}
