//! Track endpoints: where played samples come from and captured samples go
//!
//! The engine never touches project storage directly. Playback pulls
//! through [`PlaybackSource`], capture lands in a [`CaptureSink`], and
//! live per-track mixing state (gain, pan, mute, solo) sits in
//! [`TrackControls`], a block of atomics shared between the UI thread and
//! the hardware callback.
//!
//! `MemoryPlaybackSource` and `MemoryCaptureSink` are the in-memory
//! implementations; `WavCaptureSink` records straight to a WAV file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::types::{sample_to_i16, sample_to_i24, AtomicDouble, Sample, SampleFormat};

/// Which hardware output a mono track feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMap {
    Left,
    Right,
    /// Both outputs, scaled by pan
    Mono,
}

/// Live mixing controls for one track
///
/// Written by the UI thread, read by the hardware callback every buffer.
/// All accesses are relaxed; a control change landing one buffer late is
/// inaudible.
#[derive(Debug)]
pub struct TrackControls {
    gain: AtomicDouble,
    /// -1 full left .. +1 full right
    pan: AtomicDouble,
    mute: AtomicBool,
    solo: AtomicBool,
    /// Gain actually applied at the end of the previous buffer, per
    /// hardware channel; the callback ramps from it to avoid zipper noise
    old_gains: [AtomicDouble; 2],
}

impl Default for TrackControls {
    fn default() -> Self {
        Self {
            gain: AtomicDouble::new(1.0),
            pan: AtomicDouble::new(0.0),
            mute: AtomicBool::new(false),
            solo: AtomicBool::new(false),
            old_gains: [AtomicDouble::new(0.0), AtomicDouble::new(0.0)],
        }
    }
}

impl TrackControls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gain(&self) -> f64 {
        self.gain.load()
    }

    pub fn set_gain(&self, gain: f64) {
        self.gain.store(gain);
    }

    pub fn pan(&self) -> f64 {
        self.pan.load()
    }

    pub fn set_pan(&self, pan: f64) {
        self.pan.store(pan.clamp(-1.0, 1.0));
    }

    pub fn mute(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    pub fn solo(&self) -> bool {
        self.solo.load(Ordering::Relaxed)
    }

    pub fn set_solo(&self, solo: bool) {
        self.solo.store(solo, Ordering::Relaxed);
    }

    /// Effective gain for hardware channel 0 (left) or 1 (right),
    /// combining the gain fader with constant-sum panning
    pub fn channel_gain(&self, channel: usize) -> f64 {
        let pan = self.pan.load();
        let mut left = 1.0;
        let mut right = 1.0;
        if pan < 0.0 {
            right = pan + 1.0;
        } else if pan > 0.0 {
            left = 1.0 - pan;
        }
        if channel % 2 == 0 {
            left * self.gain.load()
        } else {
            right * self.gain.load()
        }
    }

    pub fn old_gain(&self, channel: usize) -> f64 {
        self.old_gains[channel & 1].load()
    }

    pub fn set_old_gain(&self, channel: usize, gain: f64) {
        self.old_gains[channel & 1].store(gain);
    }
}

/// Sample supplier for one playback track, pulled by the buffering thread
pub trait PlaybackSource: Send {
    /// Samples per second of the stored audio
    fn rate(&self) -> f64;

    /// Stored length in samples
    fn len(&self) -> u64;

    /// Copy samples beginning at index `start` into `out`, zero-filling
    /// past the end of the track. Returns the count of real samples
    /// copied.
    fn read(&mut self, start: u64, out: &mut [Sample]) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain in-memory audio, used by the demo player and tests
pub struct MemoryPlaybackSource {
    samples: Arc<Vec<Sample>>,
    rate: f64,
}

impl MemoryPlaybackSource {
    pub fn new(samples: Vec<Sample>, rate: f64) -> Self {
        Self {
            samples: Arc::new(samples),
            rate,
        }
    }

    pub fn shared(samples: Arc<Vec<Sample>>, rate: f64) -> Self {
        Self { samples, rate }
    }
}

impl PlaybackSource for MemoryPlaybackSource {
    fn rate(&self) -> f64 {
        self.rate
    }

    fn len(&self) -> u64 {
        self.samples.len() as u64
    }

    fn read(&mut self, start: u64, out: &mut [Sample]) -> usize {
        let len = self.samples.len();
        let start = (start as usize).min(len);
        let real = (len - start).min(out.len());
        out[..real].copy_from_slice(&self.samples[start..start + real]);
        out[real..].fill(0.0);
        real
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture storage full after {0} samples")]
    StorageFull(u64),
    #[error("Capture write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV encode failed: {0}")]
    Wav(#[from] hound::Error),
}

/// Destination for one channel of captured audio, fed by the buffering
/// thread
///
/// `flush` must leave storage consistent even after a failed append: the
/// append buffer may be lost, but everything flushed before it stays.
pub trait CaptureSink: Send {
    /// Samples per second the sink stores at (the track rate, which may
    /// differ from the device rate)
    fn rate(&self) -> f64;

    /// Samples appended so far
    fn len(&self) -> u64;

    /// Append captured samples. Returns true when the append started a
    /// new storage block, which a host may use to checkpoint recovery
    /// state.
    fn append(&mut self, samples: &[Sample]) -> Result<bool, CaptureError>;

    /// Append silence, used for latency-correction front padding
    fn append_silence(&mut self, count: u64) -> Result<bool, CaptureError>;

    fn flush(&mut self) -> Result<(), CaptureError>;
}

/// Block-allocated in-memory capture storage
pub struct MemoryCaptureSink {
    rate: f64,
    block_size: usize,
    blocks: Vec<Vec<Sample>>,
    len: u64,
}

impl MemoryCaptureSink {
    pub const DEFAULT_BLOCK_SIZE: usize = 262_144;

    pub fn new(rate: f64) -> Self {
        Self::with_block_size(rate, Self::DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(rate: f64, block_size: usize) -> Self {
        assert!(block_size > 0);
        Self {
            rate,
            block_size,
            blocks: Vec::new(),
            len: 0,
        }
    }

    /// All appended samples in order
    pub fn samples(&self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.len as usize);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    fn push(&mut self, sample: Sample) -> bool {
        let mut new_block = false;
        match self.blocks.last_mut() {
            Some(block) if block.len() < self.block_size => block.push(sample),
            _ => {
                let mut block = Vec::with_capacity(self.block_size);
                block.push(sample);
                self.blocks.push(block);
                new_block = true;
            }
        }
        self.len += 1;
        new_block
    }
}

impl CaptureSink for MemoryCaptureSink {
    fn rate(&self) -> f64 {
        self.rate
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn append(&mut self, samples: &[Sample]) -> Result<bool, CaptureError> {
        let mut new_block = false;
        for &sample in samples {
            new_block |= self.push(sample);
        }
        Ok(new_block)
    }

    fn append_silence(&mut self, count: u64) -> Result<bool, CaptureError> {
        let mut new_block = false;
        for _ in 0..count {
            new_block |= self.push(0.0);
        }
        Ok(new_block)
    }

    fn flush(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Capture straight to a mono WAV file at the sink's format
pub struct WavCaptureSink {
    writer: hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    format: SampleFormat,
    rate: f64,
    len: u64,
}

impl WavCaptureSink {
    pub fn create<P: AsRef<std::path::Path>>(
        path: P,
        rate: f64,
        format: SampleFormat,
    ) -> Result<Self, CaptureError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate as u32,
            bits_per_sample: format.bits(),
            sample_format: match format {
                SampleFormat::Float => hound::SampleFormat::Float,
                _ => hound::SampleFormat::Int,
            },
        };
        Ok(Self {
            writer: hound::WavWriter::create(path, spec)?,
            format,
            rate,
            len: 0,
        })
    }

    fn write(&mut self, sample: Sample) -> Result<(), CaptureError> {
        match self.format {
            SampleFormat::Int16 => self.writer.write_sample(sample_to_i16(sample))?,
            SampleFormat::Int24 => self.writer.write_sample(sample_to_i24(sample))?,
            SampleFormat::Float => self.writer.write_sample(sample)?,
        }
        self.len += 1;
        Ok(())
    }
}

impl CaptureSink for WavCaptureSink {
    fn rate(&self) -> f64 {
        self.rate
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn append(&mut self, samples: &[Sample]) -> Result<bool, CaptureError> {
        for &sample in samples {
            self.write(sample)?;
        }
        Ok(false)
    }

    fn append_silence(&mut self, count: u64) -> Result<bool, CaptureError> {
        for _ in 0..count {
            self.write(0.0)?;
        }
        Ok(false)
    }

    fn flush(&mut self) -> Result<(), CaptureError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Real-time effects pass applied by the hardware callback to each track
/// group before mixing into the output
pub trait RealtimeEffects: Send {
    /// Stream is starting at this rate
    fn initialize(&mut self, rate: f64);

    /// Register a consecutive group of `channels` playback channels;
    /// groups are processed in registration order
    fn add_group(&mut self, channels: usize);

    /// Called once per callback before any group
    fn process_start(&mut self);

    /// Process one group's channel buffers in place; all slices hold
    /// `frames` samples. Returns the frames produced, at most `frames`.
    fn process(&mut self, group: usize, buffers: &mut [&mut [Sample]], frames: usize) -> usize;

    /// Called once per callback after all groups
    fn process_end(&mut self);

    /// Stream has stopped
    fn finalize(&mut self);
}

/// Strategy object for streams with no effects configured
#[derive(Debug, Default)]
pub struct NullRealtimeEffects;

impl RealtimeEffects for NullRealtimeEffects {
    fn initialize(&mut self, _rate: f64) {}

    fn add_group(&mut self, _channels: usize) {}

    fn process_start(&mut self) {}

    fn process(&mut self, _group: usize, _buffers: &mut [&mut [Sample]], frames: usize) -> usize {
        frames
    }

    fn process_end(&mut self) {}

    fn finalize(&mut self) {}
}

/// One playback track as handed to the transport: samples, live
/// controls, and output routing
pub struct PlaybackTrack {
    pub source: Box<dyn PlaybackSource>,
    pub controls: Arc<TrackControls>,
    pub channel: ChannelMap,
}

impl PlaybackTrack {
    pub fn new(source: Box<dyn PlaybackSource>, channel: ChannelMap) -> Self {
        Self {
            source,
            controls: TrackControls::new(),
            channel,
        }
    }

    pub fn with_controls(
        source: Box<dyn PlaybackSource>,
        controls: Arc<TrackControls>,
        channel: ChannelMap,
    ) -> Self {
        Self {
            source,
            controls,
            channel,
        }
    }
}
