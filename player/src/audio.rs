//! Audio output using cpal.
//!
//! The playout scheduler talks to a narrow [`AudioSink`] trait; the cpal
//! implementation streams through a channel-fed callback. Because platform
//! stream handles are not `Send`, sinks are constructed on the audio thread
//! itself (see [`crate::scheduler`]).

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PlayerError;

/// Platform audio output.
///
/// `write` must never block: the scheduler calls it from the playout tick.
/// Volume and mute are the player-local controls (0-100), applied however the
/// platform allows; the cpal sink applies them as a gain stage.
pub trait AudioSink {
    // ---
    /// Opens (or reopens) the device for the given stream format.
    fn open(&mut self, sample_rate: u32, channels: u16, bit_depth: u16)
        -> Result<(), PlayerError>;

    /// Queues interleaved PCM bytes for playback. Non-blocking.
    fn write(&mut self, pcm: &[u8]);

    /// Halts output without discarding device state.
    fn pause(&mut self);

    /// Resumes output after a pause.
    fn resume(&mut self);

    /// Tears the device down.
    fn close(&mut self);

    /// Sets the local volume, 0-100.
    fn set_volume(&mut self, volume: u8);

    /// Current local volume, 0-100.
    fn volume(&self) -> u8;

    /// Sets the local mute flag.
    fn set_muted(&mut self, muted: bool);

    /// Current local mute flag.
    fn muted(&self) -> bool;
}

/// Shared gain applied inside the audio callback.
///
/// Stored as f32 bits so the callback never takes a lock.
#[derive(Clone)]
struct GainCell(Arc<AtomicU32>);

impl GainCell {
    // ---
    fn new(gain: f32) -> Self {
        // ---
        Self(Arc::new(AtomicU32::new(gain.to_bits())))
    }

    fn set(&self, gain: f32) {
        // ---
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f32 {
        // ---
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Format the sink is currently open for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenFormat {
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
}

/// cpal-backed audio sink.
///
/// Samples flow through an MPSC channel into the device callback; the
/// callback emits silence on underrun, which is also what keeps the device
/// quiet while the clock filter is still converging.
pub struct CpalSink {
    // ---
    stream: Option<Stream>,
    sample_tx: Option<Sender<f32>>,
    format: Option<OpenFormat>,
    gain: GainCell,
    volume: u8,
    muted: bool,
    playing: bool,
}

impl CpalSink {
    // ---
    /// Creates a closed sink. The device opens on the first `open` call.
    pub fn new() -> Self {
        // ---
        Self {
            stream: None,
            sample_tx: None,
            format: None,
            gain: GainCell::new(1.0),
            volume: 100,
            muted: false,
            playing: false,
        }
    }

    fn effective_gain(&self) -> f32 {
        // ---
        if self.muted {
            0.0
        } else {
            f32::from(self.volume) / 100.0
        }
    }

    /// Builds the cpal output stream for the given format.
    fn build_stream(
        device: &Device,
        format: OpenFormat,
        sample_rx: Receiver<f32>,
        gain: GainCell,
    ) -> Result<Stream, PlayerError> {
        // ---
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        debug!("stream config: {:?}", config);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let gain = gain.get();
                    for sample in data.iter_mut() {
                        *sample = sample_rx.try_recv().unwrap_or(0.0) * gain;
                    }
                },
                |err| {
                    warn!("audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::Audio(format!("failed to build output stream: {e}")))?;

        Ok(stream)
    }

    /// Converts interleaved integer PCM bytes to f32 samples.
    fn push_samples(&self, pcm: &[u8], bit_depth: u16) {
        // ---
        let Some(tx) = self.sample_tx.as_ref() else {
            return;
        };

        let send = |sample: f32| tx.send(sample).is_ok();

        let ok = match bit_depth {
            16 => pcm.chunks_exact(2).all(|b| {
                let v = i16::from_le_bytes([b[0], b[1]]);
                send(f32::from(v) / 32_768.0)
            }),
            24 => pcm.chunks_exact(3).all(|b| {
                // Sign-extend the 24-bit little-endian sample.
                let v = (i32::from(b[2] as i8) << 16) | (i32::from(b[1]) << 8) | i32::from(b[0]);
                send(v as f32 / 8_388_607.0)
            }),
            other => {
                warn!("unsupported bit depth {} reached the sink", other);
                return;
            }
        };

        if !ok {
            warn!("failed to send samples to audio thread");
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl AudioSink for CpalSink {
    // ---
    fn open(
        &mut self,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
    ) -> Result<(), PlayerError> {
        // ---
        let format = OpenFormat {
            sample_rate,
            channels,
            bit_depth,
        };

        if self.format == Some(format) && self.stream.is_some() {
            return Ok(());
        }

        self.close();

        info!(
            "opening audio output: {}Hz {}ch {}bit",
            sample_rate, channels, bit_depth
        );

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::Audio("no output device available".to_string()))?;

        info!(
            "using audio device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let (sample_tx, sample_rx) = mpsc::channel();
        let stream = Self::build_stream(&device, format, sample_rx, self.gain.clone())?;

        // Opened paused; the scheduler resumes once playout may start.
        stream
            .pause()
            .map_err(|e| PlayerError::Audio(format!("failed to pause stream: {e}")))?;

        self.stream = Some(stream);
        self.sample_tx = Some(sample_tx);
        self.format = Some(format);
        self.playing = false;

        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) {
        // ---
        match self.format {
            Some(format) => self.push_samples(pcm, format.bit_depth),
            None => debug!("dropping {} PCM bytes: sink not open", pcm.len()),
        }
    }

    fn pause(&mut self) {
        // ---
        if let Some(stream) = self.stream.as_ref() {
            if self.playing {
                if let Err(e) = stream.pause() {
                    warn!("failed to pause audio stream: {}", e);
                }
                self.playing = false;
            }
        }
    }

    fn resume(&mut self) {
        // ---
        if let Some(stream) = self.stream.as_ref() {
            if !self.playing {
                if let Err(e) = stream.play() {
                    warn!("failed to start audio stream: {}", e);
                } else {
                    self.playing = true;
                }
            }
        }
    }

    fn close(&mut self) {
        // ---
        self.stream = None;
        self.sample_tx = None;
        self.format = None;
        self.playing = false;
    }

    fn set_volume(&mut self, volume: u8) {
        // ---
        self.volume = volume.min(100);
        self.gain.set(self.effective_gain());
    }

    fn volume(&self) -> u8 {
        // ---
        self.volume
    }

    fn set_muted(&mut self, muted: bool) {
        // ---
        self.muted = muted;
        self.gain.set(self.effective_gain());
    }

    fn muted(&self) -> bool {
        // ---
        self.muted
    }
}

/// Sink that discards audio; used headless and in tests.
#[derive(Debug, Default)]
pub struct NullSink {
    // ---
    pub open_format: Option<(u32, u16, u16)>,
    pub bytes_written: usize,
    pub writes: Vec<usize>,
    pub paused: bool,
    volume: u8,
    muted: bool,
}

impl NullSink {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            volume: 100,
            paused: true,
            ..Self::default()
        }
    }
}

impl AudioSink for NullSink {
    // ---
    fn open(
        &mut self,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
    ) -> Result<(), PlayerError> {
        // ---
        self.open_format = Some((sample_rate, channels, bit_depth));
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) {
        // ---
        self.bytes_written += pcm.len();
        self.writes.push(pcm.len());
    }

    fn pause(&mut self) {
        // ---
        self.paused = true;
    }

    fn resume(&mut self) {
        // ---
        self.paused = false;
    }

    fn close(&mut self) {
        // ---
        self.open_format = None;
        self.paused = true;
    }

    fn set_volume(&mut self, volume: u8) {
        // ---
        self.volume = volume.min(100);
    }

    fn volume(&self) -> u8 {
        // ---
        self.volume
    }

    fn set_muted(&mut self, muted: bool) {
        // ---
        self.muted = muted;
    }

    fn muted(&self) -> bool {
        // ---
        self.muted
    }
}
