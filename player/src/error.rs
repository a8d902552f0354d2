//! Error kinds surfaced by the player core.
//!
//! Protocol input never panics the core: every failure here is either
//! recovered locally (drop a frame, reconnect) or surfaced through the
//! observable connection state.

use thiserror::Error;

/// Player error kinds.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// The channel failed to open, closed unexpectedly, or carried a
    /// malformed frame. Recoverable via reconnection.
    #[error("transport: {0}")]
    Transport(String),

    /// The peer violated the protocol (unexpected frame, unknown codec).
    #[error("protocol: {0}")]
    Protocol(String),

    /// The server refused our hello. Fatal for these credentials; no
    /// automatic reconnect.
    #[error("hello rejected: {0}")]
    HelloRejected(String),

    /// A single chunk failed to decode. The frame is dropped.
    #[error("decode: {0}")]
    Decode(String),

    /// A media frame's codec disagrees with the active stream descriptor.
    #[error("stream format mismatch: stream is {expected:?}, frame is {got:?}")]
    StreamFormatMismatch { expected: String, got: String },

    /// A timestamp conversion was attempted before the clock filter had
    /// enough measurements.
    #[error("clock not ready")]
    ClockUnready,

    /// The platform audio device failed.
    #[error("audio: {0}")]
    Audio(String),
}
