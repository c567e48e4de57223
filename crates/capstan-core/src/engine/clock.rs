//! Stream clock correlation
//!
//! Audio output is timed by the device's sample clock; MIDI output and
//! the UI readout are timed by the system clock. This module estimates
//! the offset between them, `system_minus_audio_time`, so a track time
//! can be translated into a system-clock deadline.
//!
//! Audio time, counted in samples actually written (including the zeros
//! written while paused), has a lot of jitter relative to the system
//! clock because callbacks fire a whole buffer at a time. The estimate is
//! smoothed by letting it drift deliberately low (simulating a slightly
//! fast system clock) and snapping it up whenever a callback observes
//! that audio time has moved ahead of the estimate. Drivers that report a
//! trustworthy output-buffer delay skip the slewing and use the reported
//! value directly.
//!
//! One `StreamClock` is created per stream start and shared by the
//! hardware callback (writer) and the MIDI/UI threads (readers).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::types::AtomicDouble;

/// Smallest scheduling latency the MIDI layer will accept, which prevents
/// immediate dispatch of events
pub const MIDI_MINIMAL_LATENCY_MS: i64 = 1;

/// Knobs for the correlation estimate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockTuning {
    /// Worst-case fractional clock drift compensated per frame; the
    /// estimate is slewed by `frames * drift_per_frame / rate` seconds
    /// each callback
    pub drift_per_frame: f64,
    /// Callbacks during which the output-latency estimate keeps updating.
    /// The buffer fills within this window; afterwards clock drift would
    /// contaminate the estimate.
    pub latency_probe_callbacks: u64,
    /// Seconds past the selection end before MIDI playback declares
    /// itself complete, letting the UI draw the final position
    pub settle_seconds: f64,
}

impl Default for ClockTuning {
    fn default() -> Self {
        Self {
            drift_per_frame: 0.0002,
            latency_probe_callbacks: 20,
            settle_seconds: 0.220,
        }
    }
}

/// Which timing authority the hardware callback trusts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverTimeMode {
    /// Correlate sample counts against the system clock with drift slew;
    /// needed where driver timestamps are unreliable
    #[default]
    SystemClock,
    /// Use the driver's reported output-buffer delay directly
    DeviceClock,
}

pub struct StreamClock {
    origin: Instant,
    t0: f64,
    rate: f64,
    tuning: ClockTuning,
    /// Samples written since stream start, zeros included
    num_frames: AtomicU64,
    /// Zero samples written while paused or before the stream went live
    num_pause_frames: AtomicU64,
    callback_count: AtomicU64,
    /// Previous callback's frame count, for the drift slew
    frames_per_buffer: AtomicU64,
    system_minus_audio_time: AtomicDouble,
    system_minus_audio_time_plus_latency: AtomicDouble,
    audio_out_latency: AtomicDouble,
    /// System time of the first callback less T0; the latency estimate is
    /// the distance this keeps from `system_minus_audio_time`
    start_time: AtomicDouble,
}

impl StreamClock {
    pub fn new(t0: f64, rate: f64, tuning: ClockTuning) -> Self {
        let clock = Self {
            origin: Instant::now(),
            t0,
            rate,
            tuning,
            num_frames: AtomicU64::new(0),
            num_pause_frames: AtomicU64::new(0),
            callback_count: AtomicU64::new(0),
            frames_per_buffer: AtomicU64::new(0),
            // Biased far above any plausible value so the first callback
            // always snaps the estimate
            system_minus_audio_time: AtomicDouble::new(1000.0),
            system_minus_audio_time_plus_latency: AtomicDouble::new(1000.0),
            audio_out_latency: AtomicDouble::new(0.0),
            start_time: AtomicDouble::new(0.0),
        };
        let bias = clock.system_time() + 1000.0;
        clock.system_minus_audio_time.store(bias);
        clock.system_minus_audio_time_plus_latency.store(bias);
        clock
    }

    /// Record the latency the driver reported at stream open. The
    /// correlation refines it once callbacks begin.
    pub fn set_reported_latency(&self, latency: f64) {
        self.audio_out_latency.store(latency);
        self.system_minus_audio_time_plus_latency
            .store(self.system_minus_audio_time_plus_latency.load() + latency);
    }

    /// Seconds since stream start on the system clock
    pub fn system_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Track time of the next sample to be computed, pauses included
    pub fn audio_time(&self) -> f64 {
        self.t0 + self.num_frames.load(Ordering::Relaxed) as f64 / self.rate
    }

    /// Total time spent paused so far
    pub fn pause_time(&self) -> f64 {
        self.num_pause_frames.load(Ordering::Relaxed) as f64 / self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn tuning(&self) -> &ClockTuning {
        &self.tuning
    }

    /// Nonzero once the hardware callback has fired at least once; MIDI
    /// dispatch is gated on this so the correlation has data
    pub fn num_frames(&self) -> u64 {
        self.num_frames.load(Ordering::Relaxed)
    }

    pub fn audio_out_latency(&self) -> f64 {
        self.audio_out_latency.load()
    }

    pub fn system_minus_audio_time_plus_latency(&self) -> f64 {
        self.system_minus_audio_time_plus_latency.load()
    }

    /// Hardware callback entry point: refresh the correlation for a
    /// buffer of `frames`, then account for the samples written.
    /// `driver_delay` carries the driver-reported output delay when the
    /// configuration trusts it.
    pub fn on_callback(&self, frames: usize, paused: bool, driver_delay: Option<f64>) {
        let rnow = self.system_time();
        self.update_at(rnow, frames, driver_delay);
        self.advance_frames(frames, paused);
    }

    /// Correlation step, separated from the wall clock for testing
    pub fn update_at(&self, rnow: f64, frames: usize, driver_delay: Option<f64>) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 {
            // Effectively system-minus-audio-time when the buffer is
            // empty; the gap it keeps from the settled estimate is the
            // output latency
            self.start_time.store(rnow - self.t0);
        }

        // Audio time of the first sample of this buffer
        let anow = self.audio_time();

        match driver_delay {
            None => {
                // Slew the estimate low by the worst-case drift over the
                // previous buffer, then snap it up if observed audio time
                // has moved ahead. Audio time itself is too jittery to
                // use directly; the estimate smooths it to under 1 ms.
                let increase = self.frames_per_buffer.load(Ordering::Relaxed) as f64
                    * self.tuning.drift_per_frame
                    / self.rate;
                let mut sma = self.system_minus_audio_time.load() + increase;
                let mut smal = self.system_minus_audio_time_plus_latency.load() + increase;
                let enow = rnow - sma;
                if anow > enow {
                    sma = rnow - anow;
                    if count < self.tuning.latency_probe_callbacks {
                        self.audio_out_latency.store(self.start_time.load() - sma);
                    }
                    smal = sma + self.audio_out_latency.load();
                }
                self.system_minus_audio_time.store(sma);
                self.system_minus_audio_time_plus_latency.store(smal);
            }
            Some(delay) => {
                // The driver's delay report is more precise than anything
                // we could estimate
                let sma = rnow - anow;
                self.system_minus_audio_time.store(sma);
                self.system_minus_audio_time_plus_latency.store(sma + delay);
            }
        }

        self.frames_per_buffer.store(frames as u64, Ordering::Relaxed);
    }

    fn advance_frames(&self, frames: usize, paused: bool) {
        if paused {
            self.num_pause_frames
                .fetch_add(frames as u64, Ordering::Relaxed);
        }
        self.num_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// Milliseconds on the MIDI scheduling timeline: estimated DAC output
    /// time plus one second. The 0.0005 rounds to the nearest
    /// millisecond.
    pub fn midi_time(&self) -> i64 {
        self.midi_time_at(self.system_time())
    }

    pub fn midi_time_at(&self, now: f64) -> i64 {
        let ts = (1000.0 * (now + 1.0005 - self.system_minus_audio_time_plus_latency.load()))
            as i64;
        ts + MIDI_MINIMAL_LATENCY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> StreamClock {
        StreamClock::new(0.0, 1000.0, ClockTuning::default())
    }

    #[test]
    fn test_first_callback_snaps_estimate() {
        let clock = clock();
        // Estimate starts biased ~1000 s high
        assert!(clock.system_minus_audio_time.load() > 999.0);

        clock.update_at(5.0, 100, None);
        // anow = 0 > enow = 5 - 1000ish, so the estimate snaps to 5 - 0
        assert!((clock.system_minus_audio_time.load() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_drifts_low_then_snaps() {
        let clock = clock();
        clock.update_at(5.0, 100, None);
        clock.advance_frames(100, false);

        // Next callback arrives early: audio says 0.1 s elapsed but only
        // 0.09 s of system time passed. anow (0.1) > enow (0.09 and a
        // whisker of slew), so the estimate snaps down to keep audio time
        // authoritative.
        clock.update_at(5.09, 100, None);
        assert!((clock.system_minus_audio_time.load() - 4.99).abs() < 1e-6);

        clock.advance_frames(100, false);
        // Next callback arrives late: anow (0.2) < enow (0.25 + slew), so
        // only the slew moves the estimate, by 100 * 0.0002 / 1000
        clock.update_at(5.24, 100, None);
        let expected = 4.99 + 100.0 * 0.0002 / 1000.0;
        assert!((clock.system_minus_audio_time.load() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_latency_probe_window() {
        let clock = StreamClock::new(2.0, 1000.0, ClockTuning::default());
        clock.set_reported_latency(0.5);
        assert!((clock.audio_out_latency() - 0.5).abs() < 1e-9);

        // First callback: start_time = 10 - t0 = 8; estimate snaps to
        // rnow - anow = 10 - 2 = 8, so measured latency becomes 0
        clock.update_at(10.0, 64, None);
        clock.advance_frames(64, false);
        assert!(clock.audio_out_latency().abs() < 1e-9);

        // Buffering runs ahead of real time while the buffer fills: audio
        // time outpaces the system clock, the estimate keeps snapping
        // down, and the probed latency grows to the gap
        clock.update_at(10.01, 64, None);
        clock.advance_frames(64, false);
        let expected = 8.0 - (10.01 - 2.064);
        assert!((clock.audio_out_latency() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_latency_probe_stops_after_window() {
        let tuning = ClockTuning {
            latency_probe_callbacks: 3,
            ..Default::default()
        };
        let clock = StreamClock::new(0.0, 1000.0, tuning);
        clock.update_at(1.0, 100, None);
        clock.advance_frames(100, false);
        clock.update_at(1.05, 100, None);
        clock.advance_frames(100, false);
        let settled = clock.audio_out_latency();

        // Callback 3 is outside the window; even a snap must not touch
        // the latency estimate
        clock.update_at(1.1, 100, None);
        clock.advance_frames(100, false);
        assert_eq!(clock.audio_out_latency(), settled);
    }

    #[test]
    fn test_driver_delay_is_authoritative() {
        let clock = clock();
        clock.advance_frames(500, false);
        clock.update_at(1.0, 100, Some(0.25));
        // sma = 1.0 - 0.5, plus the reported delay
        assert!((clock.system_minus_audio_time.load() - 0.5).abs() < 1e-9);
        assert!((clock.system_minus_audio_time_plus_latency() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_pause_frames_accumulate_separately() {
        let clock = clock();
        clock.advance_frames(250, false);
        clock.advance_frames(250, true);
        clock.advance_frames(500, true);
        assert_eq!(clock.num_frames(), 1000);
        assert!((clock.audio_time() - 1.0).abs() < 1e-9);
        assert!((clock.pause_time() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_midi_time_tracks_estimate() {
        let clock = clock();
        clock.advance_frames(1000, false);
        // Estimate settles at sma = 2.0 - 1.0 = 1.0, no latency
        clock.update_at(2.0, 100, Some(0.0));
        // now + 1.0005 - smal = 2.5005, in ms, plus the minimal latency
        assert_eq!(clock.midi_time_at(2.5), 2500 + MIDI_MINIMAL_LATENCY_MS);
    }
}
