//! Shared library for the Sendspin client workspace.
//!
//! This crate is the **public gateway** for all shared functionality. Per EMBP,
//! downstream crates should import through `sendspin_common::*` exports and
//! should not drill into internal module structure.

mod observability;
pub mod protocol;

pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use protocol::{
    ClientMessage, CodecTag, CommandTag, ControllerState, MediaFrame, Metadata, PlaybackState,
    RepeatMode, Role, ServerMessage, StreamDescriptor, TrackProgress, TransportAction,
    MEDIA_HEADER_LEN,
};
