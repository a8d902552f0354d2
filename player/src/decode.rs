//! Media chunk decoding.
//!
//! Each inbound media frame is decoded to interleaved PCM and annotated with
//! its server-domain presentation timestamp and duration. Decoders are
//! selected from the active stream descriptor; a frame whose codec tag
//! disagrees with the descriptor is rejected before it reaches the decoder.

use opus::Channels;
use tracing::debug;

use sendspin_common::{CodecTag, MediaFrame, StreamDescriptor};

use crate::error::PlayerError;

/// Largest Opus frame: 120 ms at 48 kHz, per channel.
const OPUS_MAX_FRAME_SAMPLES: usize = 5_760;

/// One decoded audio chunk, ready for the jitter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    // ---
    /// Server-domain instant at which the first sample should be emitted.
    pub presentation_ts_us: i64,

    /// Duration derived from sample count and sample rate.
    pub duration_us: i64,

    /// Interleaved integer samples as raw bytes.
    pub pcm: Vec<u8>,
}

/// Codec payload to PCM bytes.
pub trait Decoder: Send {
    // ---
    /// Decodes one codec payload to interleaved PCM bytes.
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, PlayerError>;

    /// Bytes per sample of the produced PCM.
    fn bytes_per_sample(&self) -> usize;
}

/// Raw PCM passthrough.
///
/// Validates frame alignment so a truncated chunk never reaches the sink as
/// garbage.
pub struct PcmDecoder {
    // ---
    bytes_per_sample: usize,
    channels: usize,
}

impl PcmDecoder {
    // ---
    /// Creates a passthrough decoder for 16- or 24-bit interleaved PCM.
    pub fn new(bit_depth: u16, channels: u16) -> Result<Self, PlayerError> {
        // ---
        let bytes_per_sample = match bit_depth {
            16 => 2,
            24 => 3,
            other => {
                return Err(PlayerError::Decode(format!(
                    "unsupported PCM bit depth: {other}"
                )))
            }
        };

        Ok(Self {
            bytes_per_sample,
            channels: channels as usize,
        })
    }
}

impl Decoder for PcmDecoder {
    // ---
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, PlayerError> {
        // ---
        let frame_size = self.bytes_per_sample * self.channels;
        if frame_size == 0 || payload.len() % frame_size != 0 {
            return Err(PlayerError::Decode(format!(
                "{} bytes is not a multiple of the {}-byte sample frame",
                payload.len(),
                frame_size
            )));
        }

        Ok(payload.to_vec())
    }

    fn bytes_per_sample(&self) -> usize {
        // ---
        self.bytes_per_sample
    }
}

/// Opus decoder wrapper producing 16-bit PCM.
pub struct OpusAudioDecoder {
    // ---
    decoder: opus::Decoder,
    channels: usize,
}

impl OpusAudioDecoder {
    // ---
    /// Creates an Opus decoder matching the stream descriptor.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, PlayerError> {
        // ---
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(PlayerError::Decode(format!(
                    "unsupported Opus channel count: {other}"
                )))
            }
        };

        let decoder = opus::Decoder::new(sample_rate, opus_channels)
            .map_err(|e| PlayerError::Decode(format!("failed to create Opus decoder: {e}")))?;

        Ok(Self {
            decoder,
            channels: channels as usize,
        })
    }
}

impl Decoder for OpusAudioDecoder {
    // ---
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, PlayerError> {
        // ---
        let mut samples = vec![0i16; OPUS_MAX_FRAME_SAMPLES * self.channels];

        let frames = self
            .decoder
            .decode(payload, &mut samples, false)
            .map_err(|e| PlayerError::Decode(format!("Opus decoding failed: {e}")))?;

        samples.truncate(frames * self.channels);

        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }

        Ok(pcm)
    }

    fn bytes_per_sample(&self) -> usize {
        // ---
        2
    }
}

/// Decodes media frames for one active stream.
///
/// Rebuilt by the session whenever a new `stream` descriptor arrives.
pub struct ChunkDecoder {
    // ---
    descriptor: StreamDescriptor,
    decoder: Box<dyn Decoder>,
}

impl ChunkDecoder {
    // ---
    /// Selects a decoder for the descriptor's codec.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Protocol`] for codecs this build cannot decode;
    /// the session keeps running and drops media frames until the next
    /// `stream` message.
    pub fn new(descriptor: &StreamDescriptor) -> Result<Self, PlayerError> {
        // ---
        let decoder: Box<dyn Decoder> = match descriptor.codec.as_str() {
            "pcm" => Box::new(PcmDecoder::new(descriptor.bit_depth, descriptor.channels)?),
            "opus" => Box::new(OpusAudioDecoder::new(
                descriptor.sample_rate,
                descriptor.channels,
            )?),
            other => {
                return Err(PlayerError::Protocol(format!("unknown codec: {other}")));
            }
        };

        debug!(
            "chunk decoder ready: {} {}Hz {}ch {}bit",
            descriptor.codec, descriptor.sample_rate, descriptor.channels, descriptor.bit_depth
        );

        Ok(Self {
            descriptor: descriptor.clone(),
            decoder,
        })
    }

    /// Decodes one media frame into a [`DecodedFrame`].
    ///
    /// # Errors
    ///
    /// - [`PlayerError::StreamFormatMismatch`] when the frame's codec tag
    ///   disagrees with the active stream
    /// - [`PlayerError::Decode`] when the payload is corrupt
    pub fn decode_frame(&mut self, frame: &MediaFrame) -> Result<DecodedFrame, PlayerError> {
        // ---
        if frame.codec.name() != self.descriptor.codec {
            return Err(PlayerError::StreamFormatMismatch {
                expected: self.descriptor.codec.clone(),
                got: frame.codec.name().to_string(),
            });
        }

        let pcm = self.decoder.decode(&frame.payload)?;

        let frame_bytes = self.decoder.bytes_per_sample() * self.descriptor.channels as usize;
        let sample_frames = pcm.len() / frame_bytes;
        let duration_us = (sample_frames as i64 * 1_000_000) / self.descriptor.sample_rate as i64;

        Ok(DecodedFrame {
            presentation_ts_us: frame.presentation_ts_us,
            duration_us,
            pcm,
        })
    }

    /// The descriptor this decoder was built for.
    pub fn descriptor(&self) -> &StreamDescriptor {
        // ---
        &self.descriptor
    }
}
