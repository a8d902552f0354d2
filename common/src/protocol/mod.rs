//! Sendspin wire protocol.
//!
//! Control traffic is JSON text frames tagged by a `type` discriminator;
//! audio arrives as binary frames with a fixed-width header. Both directions
//! share one persistent bidirectional channel.

mod media;
mod messages;

pub use media::{CodecTag, MediaFrame, MEDIA_HEADER_LEN};
pub use messages::{
    ClientMessage, CommandTag, ControllerState, Metadata, PlaybackState, RepeatMode, Role,
    ServerMessage, StreamDescriptor, TrackProgress, TransportAction,
};
