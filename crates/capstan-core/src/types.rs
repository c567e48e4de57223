//! Common types for Capstan
//!
//! Fundamental audio types shared by the transport engine: the sample
//! type used for all in-flight audio, destination sample formats for
//! capture storage, and a Pod stereo frame for zero-copy views of
//! interleaved device buffers.

/// Audio sample type (32-bit float everywhere in flight; capture sinks
/// may store narrower formats on disk)
pub type Sample = f32;

/// Default sample rate when neither the caller nor the device expresses
/// a preference
pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

/// Returned by stream-time queries when no stream is active
pub const BAD_STREAM_TIME: f64 = -1_000_000.0;

/// Destination sample format of a track's persistent storage
///
/// Samples travel through the engine as `f32`; the format tag rides along
/// so capture sinks know what to narrow to when appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    Int16,
    Int24,
    #[default]
    Float,
}

impl SampleFormat {
    /// Bytes per sample in storage
    pub fn bytes(&self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Int24 => 3,
            SampleFormat::Float => 4,
        }
    }

    /// Bits per sample in storage
    pub fn bits(&self) -> u16 {
        (self.bytes() * 8) as u16
    }
}

/// Narrow a float sample to a signed 16-bit value with saturation
#[inline]
pub fn sample_to_i16(v: Sample) -> i16 {
    (v.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Narrow a float sample to a signed 24-bit value (stored in an i32) with
/// saturation
#[inline]
pub fn sample_to_i24(v: Sample) -> i32 {
    const MAX24: f32 = 8_388_607.0;
    (v.clamp(-1.0, 1.0) * MAX24).round() as i32
}

/// Lock-free `f64` cell stored as a bit-cast `AtomicU64`
///
/// Single writer, any number of readers; Relaxed ordering is enough because
/// readers only want a recent value, never ordering against other data.
#[derive(Debug, Default)]
pub struct AtomicDouble(std::sync::atomic::AtomicU64);

impl AtomicDouble {
    pub fn new(value: f64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(std::sync::atomic::Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0
            .store(value.to_bits(), std::sync::atomic::Ordering::Relaxed);
    }
}

/// A single stereo frame (left and right channels)
///
/// `#[repr(C)]` guarantees the [left, right] layout, so a `&mut [f32]`
/// interleaved device buffer casts to `&mut [StereoFrame]` with bytemuck
/// and the mix loop works frame-at-a-time without index arithmetic.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoFrame {
    pub left: Sample,
    pub right: Sample,
}

impl StereoFrame {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Accumulate a mono sample with independent channel gains
    #[inline]
    pub fn accumulate(&mut self, value: Sample, gain_left: Sample, gain_right: Sample) {
        self.left += value * gain_left;
        self.right += value * gain_right;
    }

    /// Clamp both channels into [-1, +1]
    #[inline]
    pub fn clipped(self) -> Self {
        Self {
            left: self.left.clamp(-1.0, 1.0),
            right: self.right.clamp(-1.0, 1.0),
        }
    }

    /// Peak amplitude across the two channels
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_narrowing_saturates() {
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), -i16::MAX);
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i24(1.0), 8_388_607);
        assert_eq!(sample_to_i24(-1.0), -8_388_607);
    }

    #[test]
    fn test_stereo_frame_cast() {
        let mut raw = [0.0f32, 0.0, 0.25, -0.5];
        let frames: &mut [StereoFrame] = bytemuck::cast_slice_mut(&mut raw);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].left, 0.25);
        frames[0].accumulate(1.0, 0.5, 0.75);
        assert_eq!(raw[0], 0.5);
        assert_eq!(raw[1], 0.75);
    }

    #[test]
    fn test_clipping() {
        let f = StereoFrame::new(1.5, -3.0).clipped();
        assert_eq!(f.left, 1.0);
        assert_eq!(f.right, -1.0);
    }
}
