//! Capture-side sample rate conversion
//!
//! When the device could not be opened at the track rate, captured audio
//! arrives at the device rate and has to be converted before it reaches a
//! sink. The conversion ratio is fixed for the life of a stream, so this
//! wraps rubato's FFT resampler, which wants fixed-size input blocks,
//! behind an accumulate-and-drain interface that accepts whatever chunk
//! the ring buffer handed over.
//!
//! One instance per capture channel. `flush` pushes the filter's delay
//! line through at stop time and trims the total output to exactly
//! `round(input_samples * ratio)`, so a recording is never short by the
//! resampler latency.

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

use crate::types::Sample;

/// Input block size fed to the inner resampler
const BLOCK: usize = 1024;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("failed to build rate converter: {0}")]
    Init(#[from] rubato::ResamplerConstructionError),
    #[error("rate conversion failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

pub struct CaptureResampler {
    inner: FftFixedIn<Sample>,
    ratio: f64,
    pending: Vec<Sample>,
    /// Leading output frames still to be dropped (filter group delay)
    delay_remaining: usize,
    /// Real input samples accepted so far (flush padding not counted)
    consumed: u64,
    emitted: u64,
}

impl CaptureResampler {
    pub fn new(device_rate: f64, track_rate: f64) -> Result<Self, ResampleError> {
        let inner = FftFixedIn::new(
            device_rate.round() as usize,
            track_rate.round() as usize,
            BLOCK,
            2,
            1,
        )?;
        let delay_remaining = inner.output_delay();
        Ok(Self {
            inner,
            ratio: track_rate / device_rate,
            pending: Vec::with_capacity(2 * BLOCK),
            delay_remaining,
            consumed: 0,
            emitted: 0,
        })
    }

    /// Feed captured samples, appending whatever full blocks convert to
    /// `out`. Short tails stay buffered until more input or `flush`.
    pub fn process(&mut self, input: &[Sample], out: &mut Vec<Sample>) -> Result<(), ResampleError> {
        self.consumed += input.len() as u64;
        self.pending.extend_from_slice(input);
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }
            let block = self.inner.process(&[&self.pending[..needed]], None)?;
            self.pending.drain(..needed);
            self.emit(&block[0], usize::MAX, out);
        }
    }

    /// Drain the tail at end of stream. Pads with silence until the
    /// delayed output catches up, then stops exactly at the sample count
    /// the input corresponds to.
    pub fn flush(&mut self, out: &mut Vec<Sample>) -> Result<(), ResampleError> {
        let target = (self.consumed as f64 * self.ratio).round() as u64;
        while self.emitted < target {
            let needed = self.inner.input_frames_next();
            self.pending.resize(needed, 0.0);
            let block = self.inner.process(&[&self.pending[..needed]], None)?;
            self.pending.clear();
            let limit = (target - self.emitted) as usize;
            self.emit(&block[0], limit, out);
        }
        Ok(())
    }

    fn emit(&mut self, block: &[Sample], limit: usize, out: &mut Vec<Sample>) {
        let skip = self.delay_remaining.min(block.len());
        self.delay_remaining -= skip;
        let usable = &block[skip..];
        let take = usable.len().min(limit);
        out.extend_from_slice(&usable[..take]);
        self.emitted += take as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: f64, hz: f64, amp: f32, len: usize) -> Vec<Sample> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * hz as f32 * i as f32 / rate as f32).sin())
            .collect()
    }

    fn rms(samples: &[Sample]) -> f32 {
        (samples.iter().map(|v| v * v).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_output_length_matches_ratio() {
        let mut rs = CaptureResampler::new(48000.0, 44100.0).unwrap();
        let input = sine(48000.0, 1000.0, 0.5, 4800);
        let mut out = Vec::new();
        rs.process(&input, &mut out).unwrap();
        rs.flush(&mut out).unwrap();
        let expected = (4800.0_f64 * 44100.0 / 48000.0).round() as usize;
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn test_variable_chunks_equal_one_shot() {
        let input = sine(44100.0, 440.0, 0.5, 5000);

        let mut one = CaptureResampler::new(44100.0, 48000.0).unwrap();
        let mut out_one = Vec::new();
        one.process(&input, &mut out_one).unwrap();
        one.flush(&mut out_one).unwrap();

        let mut many = CaptureResampler::new(44100.0, 48000.0).unwrap();
        let mut out_many = Vec::new();
        for chunk in input.chunks(337) {
            many.process(chunk, &mut out_many).unwrap();
        }
        many.flush(&mut out_many).unwrap();

        assert_eq!(out_one.len(), out_many.len());
        for (a, b) in out_one.iter().zip(&out_many) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_signal_level_preserved() {
        let mut rs = CaptureResampler::new(48000.0, 44100.0).unwrap();
        let input = sine(48000.0, 1000.0, 0.5, 9600);
        let mut out = Vec::new();
        rs.process(&input, &mut out).unwrap();
        rs.flush(&mut out).unwrap();
        // A 1 kHz tone sits far below the transition band and should come
        // through at the same level
        let expected = 0.5 / std::f32::consts::SQRT_2;
        assert!((rms(&out) - expected).abs() < 0.05, "rms {}", rms(&out));
    }

    #[test]
    fn test_flush_without_input_is_empty() {
        let mut rs = CaptureResampler::new(96000.0, 44100.0).unwrap();
        let mut out = Vec::new();
        rs.flush(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
