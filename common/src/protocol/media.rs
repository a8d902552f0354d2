//! Binary media frame structure and serialization.
//!
//! Audio chunks travel as binary frames with a fixed 13-byte header in front
//! of the codec payload. The header ties each chunk to the server-domain
//! instant at which its first sample must be emitted.

use anyhow::Result;

/// Fixed header size: i64 timestamp + u8 codec tag + u32 payload length.
pub const MEDIA_HEADER_LEN: usize = 13;

/// Codec identifier carried in every media frame header.
///
/// The tag cross-checks each frame against the codec announced by the
/// `stream` control frame; the two must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecTag {
    Pcm,
    Opus,
    Flac,
}

impl CodecTag {
    // ---
    /// Parses a wire tag. Unknown values are rejected by the caller.
    pub fn from_u8(tag: u8) -> Option<Self> {
        // ---
        match tag {
            0 => Some(CodecTag::Pcm),
            1 => Some(CodecTag::Opus),
            2 => Some(CodecTag::Flac),
            _ => None,
        }
    }

    /// Wire value of this tag.
    pub fn as_u8(self) -> u8 {
        // ---
        match self {
            CodecTag::Pcm => 0,
            CodecTag::Opus => 1,
            CodecTag::Flac => 2,
        }
    }

    /// Codec name as it appears in the `stream` control frame.
    pub fn name(self) -> &'static str {
        // ---
        match self {
            CodecTag::Pcm => "pcm",
            CodecTag::Opus => "opus",
            CodecTag::Flac => "flac",
        }
    }
}

/// One encoded audio chunk.
///
/// # Wire Format
///
/// ```text
/// | presentation_ts_us: i64 BE | codec_tag: u8 | payload_len: u32 BE | payload... |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    // ---
    /// Server-domain instant at which the first sample should be emitted.
    pub presentation_ts_us: i64,

    /// Codec of the payload.
    pub codec: CodecTag,

    /// Encoded audio bytes.
    pub payload: Vec<u8>,
}

impl MediaFrame {
    // ---
    /// Creates a new media frame.
    pub fn new(presentation_ts_us: i64, codec: CodecTag, payload: Vec<u8>) -> Self {
        // ---
        Self {
            presentation_ts_us,
            codec,
            payload,
        }
    }

    /// Serializes the frame into wire format.
    ///
    /// Only servers transmit media frames; the client-side encoder exists for
    /// simulators and tests.
    pub fn encode(&self) -> Vec<u8> {
        // ---
        let mut buf = Vec::with_capacity(MEDIA_HEADER_LEN + self.payload.len());

        buf.extend_from_slice(&self.presentation_ts_us.to_be_bytes());
        buf.push(self.codec.as_u8());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserializes a media frame from wire format.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The frame is smaller than the fixed header
    /// - The codec tag is unknown
    /// - The declared payload length disagrees with the frame size
    pub fn decode(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < MEDIA_HEADER_LEN {
            anyhow::bail!("media frame too small: {} bytes", data.len());
        }

        let presentation_ts_us = i64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);

        let codec = CodecTag::from_u8(data[8])
            .ok_or_else(|| anyhow::anyhow!("unknown codec tag: {}", data[8]))?;

        let payload_len = u32::from_be_bytes([data[9], data[10], data[11], data[12]]) as usize;

        if data.len() - MEDIA_HEADER_LEN != payload_len {
            anyhow::bail!(
                "payload length mismatch: header says {}, frame carries {}",
                payload_len,
                data.len() - MEDIA_HEADER_LEN
            );
        }

        Ok(Self {
            presentation_ts_us,
            codec,
            payload: data[MEDIA_HEADER_LEN..].to_vec(),
        })
    }
}
