//! Player configuration.

/// Configuration for a [`crate::Player`].
///
/// Defaults match the reference deployment; only the playout offset usually
/// needs tuning per installation.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    // ---
    /// Stable client identifier sent in the hello handshake.
    pub client_id: String,

    /// Human-readable client name shown by controllers.
    pub client_name: String,

    /// Signed playout offset in milliseconds, clamped to [-1000, 1000].
    /// Negative shifts playback earlier (catch-up); positive delays it.
    pub playout_offset_ms: i32,

    /// Hard cap on queued chunks; the oldest chunk is evicted beyond this.
    /// The default comfortably holds 2 s of audio at 20 ms per chunk.
    pub max_queued: usize,
}

impl PlayerConfig {
    // ---
    /// Playout offset in microseconds, clamped to the supported range.
    pub fn playout_offset_us(&self) -> i64 {
        // ---
        i64::from(self.playout_offset_ms.clamp(-1_000, 1_000)) * 1_000
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        // ---
        Self {
            client_id: "android-player-1".to_string(),
            client_name: "Android Player".to_string(),
            playout_offset_ms: -300,
            max_queued: 500,
        }
    }
}
