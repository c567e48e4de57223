//! Recording schedule: latency accounting for capture
//!
//! Capture hardware delivers samples late by some device-dependent offset,
//! and a punch-in may deliberately start the stream early (pre-roll). Both
//! corrections are folded into one signed total that decides, at the head
//! of the stream, whether arriving samples are discarded (positive delay
//! not yet consumed) or the track is padded with silence (correction
//! larger than the buffered backlog).
//!
//! `position` is advanced by the buffering thread once per fill pass; the
//! transport reads it when deciding whether the requested duration has
//! been captured.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{AtomicDouble, Sample};

pub struct RecordingSchedule {
    pre_roll: f64,
    /// Estimated capture offset in seconds, normally negative
    latency_correction: f64,
    /// Requested capture length in track seconds
    duration: f64,
    /// Per-channel tails of previously recorded audio, blended over the
    /// first samples of a punch-in capture
    crossfade_data: Vec<Vec<Sample>>,
    /// Seconds of capture consumed from the ring buffers so far
    position: AtomicDouble,
    latency_corrected: AtomicBool,
}

impl RecordingSchedule {
    pub fn new(
        pre_roll: f64,
        latency_correction: f64,
        duration: f64,
        crossfade_data: Vec<Vec<Sample>>,
    ) -> Self {
        Self {
            pre_roll,
            latency_correction,
            duration,
            crossfade_data,
            position: AtomicDouble::new(0.0),
            latency_corrected: AtomicBool::new(false),
        }
    }

    pub fn pre_roll(&self) -> f64 {
        self.pre_roll
    }

    pub fn latency_correction(&self) -> f64 {
        self.latency_correction
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Net signed correction applied at the head of the capture
    pub fn total_correction(&self) -> f64 {
        self.latency_correction - self.pre_roll
    }

    /// Seconds of capture that have landed in tracks, after correction
    pub fn consumed(&self) -> f64 {
        (self.position.load() + self.total_correction()).max(0.0)
    }

    /// Seconds of capture still owed. May go negative once the requested
    /// duration is exceeded; callers clamp.
    pub fn to_consume(&self) -> f64 {
        self.duration - self.consumed()
    }

    /// Seconds still to be dropped from the stream head
    pub fn to_discard(&self) -> f64 {
        (-(self.position.load() + self.total_correction())).max(0.0)
    }

    pub fn position(&self) -> f64 {
        self.position.load()
    }

    pub fn advance_position(&self, seconds: f64) {
        self.position.store(self.position.load() + seconds);
    }

    pub fn latency_corrected(&self) -> bool {
        self.latency_corrected.load(Ordering::Relaxed)
    }

    pub fn set_latency_corrected(&self, corrected: bool) {
        self.latency_corrected.store(corrected, Ordering::Relaxed);
    }

    pub fn has_crossfade_data(&self) -> bool {
        self.crossfade_data.iter().any(|data| !data.is_empty())
    }

    /// Blend the retained tail of channel `channel` into `dest`, ramping
    /// linearly from old audio to new over the tail's length. `dest` holds
    /// newly captured samples at the track rate, starting at the current
    /// consumed position.
    pub fn apply_crossfade(&self, channel: usize, dest: &mut [Sample], track_rate: f64) {
        let Some(data) = self.crossfade_data.get(channel) else {
            return;
        };
        let length = data.len();
        if length == 0 {
            return;
        }
        let start = (self.consumed() * track_rate).floor() as usize;
        if start >= length {
            return;
        }
        let count = (length - start).min(dest.len());
        let ratio_step = 1.0 / length as f64;
        let raw_ratio = start as f64 * ratio_step;
        for (i, (dst, src)) in dest[..count].iter_mut().zip(&data[start..]).enumerate() {
            let ratio = raw_ratio + i as f64 * ratio_step;
            *dst = (*dst as f64 * ratio + *src as f64 * (1.0 - ratio)) as Sample;
        }
    }
}
