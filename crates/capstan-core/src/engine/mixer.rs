//! Per-track playback mixer
//!
//! One mixer per playback track, owned by the buffering thread. Despite
//! the name it does not sum tracks; it turns stored track samples into
//! device-rate samples, handling rate conversion, optional time warping,
//! and scrub varispeed in one variable-speed read with Catmull-Rom
//! interpolation. Per-track gain is applied later, in the hardware
//! callback, so live fader moves act on already-buffered audio.
//!
//! The mixer walks a fractional read head through the source and refills
//! a sliding fetch window as the head moves, so sources only ever see
//! block reads.

use std::sync::Arc;

use crate::engine::track::PlaybackSource;
use crate::schedule::warp::TimeWarp;
use crate::types::Sample;

/// Sliding window size, in source samples
const FETCH: usize = 1024;

pub struct TrackMixer {
    source: Box<dyn PlaybackSource>,
    source_rate: f64,
    device_rate: f64,
    t0: f64,
    t1: f64,
    warp: Option<Arc<dyn TimeWarp>>,
    /// Read head in source samples (fractional)
    position: f64,
    end_position: f64,
    forward: bool,
    /// Source samples consumed per output sample when not warping
    step: f64,
    /// Signed real seconds per output sample, for the warp solve
    real_step: f64,
    buffer: Vec<Sample>,
    window: Vec<Sample>,
    window_start: i64,
}

impl TrackMixer {
    pub fn new(
        source: Box<dyn PlaybackSource>,
        device_rate: f64,
        t0: f64,
        t1: f64,
        warp: Option<Arc<dyn TimeWarp>>,
        chunk_size: usize,
    ) -> Self {
        let source_rate = source.rate();
        let forward = t1 >= t0;
        let dir = if forward { 1.0 } else { -1.0 };
        Self {
            source,
            source_rate,
            device_rate,
            t0,
            t1,
            warp,
            position: t0 * source_rate,
            end_position: t1 * source_rate,
            forward,
            step: dir * source_rate / device_rate,
            real_step: dir / device_rate,
            buffer: Vec::with_capacity(chunk_size),
            window: vec![0.0; FETCH],
            // Forces a fetch on first use
            window_start: i64::MIN / 2,
        }
    }

    /// Produce up to `max_frames` device-rate samples, stopping at the
    /// end time. The returned slice is valid until the next call.
    pub fn process(&mut self, max_frames: usize) -> &[Sample] {
        self.buffer.clear();
        while self.buffer.len() < max_frames {
            let done = if self.forward {
                self.position >= self.end_position
            } else {
                self.position <= self.end_position
            };
            if done {
                break;
            }
            let value = self.interpolate(self.position);
            self.buffer.push(value);
            self.advance();
        }
        &self.buffer
    }

    /// Move the read head to an absolute track time, clamped into the
    /// mixer's span
    pub fn reposition(&mut self, time: f64) {
        let (lo, hi) = if self.forward {
            (self.t0, self.t1)
        } else {
            (self.t1, self.t0)
        };
        self.position = time.clamp(lo, hi) * self.source_rate;
    }

    /// Back to the start time, used at loop wraparound
    pub fn restart(&mut self) {
        self.position = self.t0 * self.source_rate;
    }

    /// Reprogram the mixer for one scrub interval: play `t0..t1` at a
    /// constant speed multiple
    pub fn set_times_and_speed(&mut self, t0: f64, t1: f64, speed: f64) {
        self.t0 = t0;
        self.t1 = t1;
        self.forward = t1 >= t0;
        let dir = if self.forward { 1.0 } else { -1.0 };
        self.position = t0 * self.source_rate;
        self.end_position = t1 * self.source_rate;
        self.step = dir * speed * self.source_rate / self.device_rate;
        self.real_step = dir / self.device_rate;
    }

    /// Current read head as a track time
    pub fn time(&self) -> f64 {
        self.position / self.source_rate
    }

    fn advance(&mut self) {
        match &self.warp {
            None => self.position += self.step,
            Some(warp) => {
                let t = self.position / self.source_rate;
                let nt = warp.solve_warped_length(t, self.real_step);
                self.position = nt * self.source_rate;
            }
        }
    }

    /// Catmull-Rom read at a fractional source position
    fn interpolate(&mut self, position: f64) -> Sample {
        let index = position.floor() as i64;
        let t = (position - position.floor()) as f32;

        let s0 = self.sample_at(index - 1);
        let s1 = self.sample_at(index);
        let s2 = self.sample_at(index + 1);
        let s3 = self.sample_at(index + 2);

        let t2 = t * t;
        let t3 = t2 * t;
        let c0 = -0.5 * t3 + t2 - 0.5 * t;
        let c1 = 1.5 * t3 - 2.5 * t2 + 1.0;
        let c2 = -1.5 * t3 + 2.0 * t2 + 0.5 * t;
        let c3 = 0.5 * t3 - 0.5 * t2;

        s0 * c0 + s1 * c1 + s2 * c2 + s3 * c3
    }

    fn sample_at(&mut self, index: i64) -> Sample {
        if index < 0 || index >= self.source.len() as i64 {
            return 0.0;
        }
        let offset = index - self.window_start;
        if offset < 0 || offset >= self.window.len() as i64 {
            self.fetch(index);
        }
        self.window[(index - self.window_start) as usize]
    }

    fn fetch(&mut self, needed: i64) {
        // Place the window so the head can keep moving in its current
        // direction without another fetch
        let start = if self.step >= 0.0 {
            (needed - 2).max(0)
        } else {
            (needed + 4 - FETCH as i64).max(0)
        };
        self.source.read(start as u64, &mut self.window);
        self.window_start = start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::track::MemoryPlaybackSource;
    use crate::schedule::warp::StepWarp;

    fn ramp(len: usize) -> Vec<Sample> {
        (0..len).map(|i| i as f32).collect()
    }

    fn mixer(source_rate: f64, device_rate: f64, t0: f64, t1: f64) -> TrackMixer {
        let source = MemoryPlaybackSource::new(ramp(2000), source_rate);
        TrackMixer::new(Box::new(source), device_rate, t0, t1, None, 256)
    }

    #[test]
    fn test_unity_rate_reproduces_source() {
        let mut mixer = mixer(1000.0, 1000.0, 0.0, 0.1);
        let out = mixer.process(64).to_vec();
        assert_eq!(out.len(), 64);
        for (i, v) in out.iter().enumerate() {
            assert!((v - i as f32).abs() < 1e-4);
        }
        // The remainder of the selection, then nothing
        assert_eq!(mixer.process(64).len(), 36);
        assert_eq!(mixer.process(64).len(), 0);
    }

    #[test]
    fn test_rate_conversion_interpolates() {
        // Device runs twice as fast as the source: half-sample steps.
        // On a linear ramp the spline is exact away from the edges.
        let mut mixer = mixer(1000.0, 2000.0, 0.01, 0.1);
        let out = mixer.process(8).to_vec();
        for (i, v) in out.iter().enumerate() {
            let expected = 10.0 + i as f32 * 0.5;
            assert!((v - expected).abs() < 1e-3, "sample {i}: {v} vs {expected}");
        }
    }

    #[test]
    fn test_reversed_play_walks_backward() {
        let mut mixer = mixer(1000.0, 1000.0, 0.1, 0.05);
        let out = mixer.process(10).to_vec();
        for (i, v) in out.iter().enumerate() {
            assert!((v - (100.0 - i as f32)).abs() < 1e-3);
        }
        // 50 samples span the reversed selection
        assert_eq!(mixer.process(100).len(), 40);
        assert_eq!(mixer.process(100).len(), 0);
    }

    #[test]
    fn test_scrub_interval_speed() {
        let mut mixer = mixer(1000.0, 1000.0, 0.0, 2.0);
        // 2x speed over 0..0.05 s: 50 source samples in 25 output frames
        mixer.set_times_and_speed(0.0, 0.05, 2.0);
        let out = mixer.process(100).to_vec();
        assert_eq!(out.len(), 25);
        assert!((out[1] - 2.0).abs() < 1e-3);
        assert!((out[10] - 20.0).abs() < 1e-3);

        // Backward interval
        mixer.set_times_and_speed(0.05, 0.0, 2.0);
        let back = mixer.process(100).to_vec();
        assert_eq!(back.len(), 25);
        assert!((back[1] - 48.0).abs() < 1e-3);
    }

    #[test]
    fn test_warp_scales_consumption() {
        let source = MemoryPlaybackSource::new(ramp(2000), 1000.0);
        let warp: Arc<dyn TimeWarp> = Arc::new(StepWarp::constant(2.0));
        let mut mixer =
            TrackMixer::new(Box::new(source), 1000.0, 0.0, 1.0, Some(warp), 256);
        let out = mixer.process(8).to_vec();
        // Double speed consumes two source samples per output sample
        for (i, v) in out.iter().enumerate() {
            assert!((v - (i as f32 * 2.0)).abs() < 1e-3);
        }
    }

    #[test]
    fn test_reposition_and_restart() {
        let mut mixer = mixer(1000.0, 1000.0, 0.0, 1.0);
        mixer.reposition(0.5);
        assert!((mixer.process(1)[0] - 500.0).abs() < 1e-3);

        // Out-of-span times clamp
        mixer.reposition(5.0);
        assert!((mixer.time() - 1.0).abs() < 1e-9);

        mixer.restart();
        assert!((mixer.process(1)[0] - 0.0).abs() < 1e-3);
    }

    #[test]
    fn test_selection_past_source_end_pads_zeros() {
        let source = MemoryPlaybackSource::new(ramp(50), 1000.0);
        let mut mixer = TrackMixer::new(Box::new(source), 1000.0, 0.0, 0.1, None, 256);
        let out = mixer.process(100).to_vec();
        // The selection is authoritative: a short source still yields
        // frames, padded with silence
        assert_eq!(out.len(), 100);
        assert!((out[49] - 49.0).abs() < 1e-3);
        assert_eq!(out[50], 0.0);
        assert_eq!(out[99], 0.0);
    }
}
