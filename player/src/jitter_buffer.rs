//! Jitter buffer for decoded audio chunks.
//!
//! Holds future-dated frames keyed by their server-domain presentation
//! timestamp until the playout scheduler releases them. Compensates for
//! network variance by absorbing bursts and re-establishing timestamp order.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::decode::DecodedFrame;

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    // ---
    /// Maximum chunks to buffer before evicting the oldest.
    pub max_queued: usize,

    /// Signed playout offset in microseconds. Shifts every frame's effective
    /// play instant; negative plays earlier, positive delays.
    pub playout_offset_us: i64,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            max_queued: 500,
            playout_offset_us: -300_000,
        }
    }
}

/// Ordered set of decoded frames awaiting their release instant.
///
/// Frames are uniquely identified by presentation timestamp within a stream
/// segment: later duplicates are dropped. Frames whose effective play instant
/// already passed are dropped on insert and counted as late.
pub struct JitterBuffer {
    // ---
    config: JitterBufferConfig,

    /// Frames keyed ascending by presentation timestamp.
    frames: BTreeMap<i64, DecodedFrame>,

    /// Frames that missed their playout deadline (insert or release side).
    late_drops: u64,

    /// Frames dropped as duplicate timestamps.
    duplicate_drops: u64,

    /// Frames evicted by the capacity bound.
    overflow_drops: u64,
}

impl JitterBuffer {
    // ---
    /// Creates an empty buffer with the given configuration.
    pub fn new(config: JitterBufferConfig) -> Self {
        // ---
        Self {
            config,
            frames: BTreeMap::new(),
            late_drops: 0,
            duplicate_drops: 0,
            overflow_drops: 0,
        }
    }

    /// Inserts a decoded frame.
    ///
    /// `server_now_us` is the current server-domain time, or `None` while the
    /// clock filter is not yet ready (the late check is skipped then so the
    /// buffer fills during convergence).
    ///
    /// Returns `true` if the frame was queued, `false` if discarded (late or
    /// duplicate).
    pub fn insert(&mut self, frame: DecodedFrame, server_now_us: Option<i64>) -> bool {
        // ---
        if let Some(now) = server_now_us {
            if self.effective_play_instant(&frame) < now {
                self.late_drops += 1;
                warn!(
                    "discarding late chunk: ts={} now={}",
                    frame.presentation_ts_us, now
                );
                return false;
            }
        }

        if self.frames.contains_key(&frame.presentation_ts_us) {
            self.duplicate_drops += 1;
            debug!("discarding duplicate chunk: ts={}", frame.presentation_ts_us);
            return false;
        }

        self.frames.insert(frame.presentation_ts_us, frame);

        // Enforce max buffer size
        if self.frames.len() > self.config.max_queued {
            warn!("buffer overflow, dropping oldest chunk");
            self.frames.pop_first();
            self.overflow_drops += 1;
        }

        true
    }

    /// Pops the next frame whose effective play instant has arrived.
    ///
    /// Returns `None` when the head frame is still in the future or the
    /// buffer is empty.
    pub fn pop_due(&mut self, server_now_us: i64) -> Option<DecodedFrame> {
        // ---
        let (&ts, frame) = self.frames.first_key_value()?;

        if frame.presentation_ts_us + self.config.playout_offset_us <= server_now_us {
            return self.frames.remove(&ts);
        }

        None
    }

    /// Drops everything (stream end, disconnect).
    pub fn clear(&mut self) {
        // ---
        self.frames.clear();
    }

    /// Resets drop counters along with the contents (new connection).
    pub fn reset(&mut self) {
        // ---
        self.frames.clear();
        self.late_drops = 0;
        self.duplicate_drops = 0;
        self.overflow_drops = 0;
    }

    /// Counts a frame that was popped too late to be written.
    pub fn mark_late_release(&mut self) {
        // ---
        self.late_drops += 1;
    }

    /// Number of queued chunks.
    pub fn queued_chunks(&self) -> usize {
        // ---
        self.frames.len()
    }

    /// Milliseconds of audio buffered past `server_now_us`.
    pub fn buffer_ahead_ms(&self, server_now_us: i64) -> i64 {
        // ---
        match self.frames.last_key_value() {
            Some((_, last)) => {
                let end = last.presentation_ts_us + last.duration_us;
                (end - server_now_us).max(0) / 1_000
            }
            None => 0,
        }
    }

    /// Total frames that missed their playout deadline.
    pub fn late_drops(&self) -> u64 {
        // ---
        self.late_drops
    }

    /// Total frames dropped as duplicates.
    pub fn duplicate_drops(&self) -> u64 {
        // ---
        self.duplicate_drops
    }

    /// Total frames evicted by the capacity bound.
    pub fn overflow_drops(&self) -> u64 {
        // ---
        self.overflow_drops
    }

    /// The configured playout offset (µs).
    pub fn playout_offset_us(&self) -> i64 {
        // ---
        self.config.playout_offset_us
    }

    fn effective_play_instant(&self, frame: &DecodedFrame) -> i64 {
        // ---
        frame.presentation_ts_us + self.config.playout_offset_us
    }
}
