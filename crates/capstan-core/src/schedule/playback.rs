//! Playback schedule: the real-time to track-time mapping
//!
//! Every consumer of playback position (UI readout, buffer-fill sizing,
//! MIDI timestamping) observes one consistent mapping from elapsed real
//! time to "track time", and this type owns that mapping: loop wraparound,
//! optional variable-speed warping, cut-preview gap skipping, and
//! completion detection all live here.
//!
//! Mutation is split across threads by field: the UI thread sets track
//! time at start and seek, the hardware callback advances it once per
//! buffer period (when not scrubbing), and the buffering thread runs the
//! separate warped-time accumulator that decides how many seconds' worth
//! of samples to produce. The two mutable fields are atomic doubles, so
//! the schedule is shared as a plain `Arc` with no locks.

use std::sync::Arc;

use crate::schedule::recording::RecordingSchedule;
use crate::schedule::scrub::{ScrubbingOptions, MIN_SCRUB_SPEED};
use crate::schedule::warp::TimeWarp;
use crate::types::{AtomicDouble, DEFAULT_SAMPLE_RATE};

/// How elapsed real time maps onto track time for this stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// Fixed span, once through
    Straight,
    /// Fixed span, wrapping from T1 back to T0
    Looped,
    /// Position driven by the scrub queue
    Scrub,
    /// Scrub-queue driven but with a single sustained speed (completes
    /// like straight play)
    AtSpeed,
}

/// Options bundle accepted by stream start
///
/// Collects everything the schedules need to be built; the transport fills
/// `latency_correction` from settings unless the caller overrides it.
pub struct StartStreamOptions {
    /// Device sample rate for the stream
    pub rate: f64,
    /// Optional variable-speed curve (ignored while capturing)
    pub warp: Option<Arc<dyn TimeWarp>>,
    pub looped: bool,
    /// Cut preview: a (start, length) gap the position readout jumps over
    pub cut_preview_gap: Option<(f64, f64)>,
    /// Seconds of existing audio played before the recording start point
    pub pre_roll: f64,
    /// Estimated hardware+scheduling recording offset, in seconds
    /// (normally negative)
    pub latency_correction: f64,
    /// Start position override, clamped into the selection
    pub start_time: Option<f64>,
    /// Present when the stream is gesture-driven
    pub scrubbing: Option<ScrubbingOptions>,
    /// Per-channel previously-captured samples blended over a punch-in
    /// recording start
    pub crossfade_data: Vec<Vec<f32>>,
}

impl Default for StartStreamOptions {
    fn default() -> Self {
        Self {
            rate: DEFAULT_SAMPLE_RATE,
            warp: None,
            looped: false,
            cut_preview_gap: None,
            pre_roll: 0.0,
            latency_correction: 0.0,
            start_time: None,
            scrubbing: None,
            crossfade_data: Vec::new(),
        }
    }
}

pub struct PlaybackSchedule {
    t0: f64,
    t1: f64,
    mode: PlayMode,
    warp: Option<Arc<dyn TimeWarp>>,
    /// Total real seconds the selection takes to play (0 while scrubbing)
    warped_length: f64,
    cut_preview_gap_start: f64,
    cut_preview_gap_len: f64,
    /// Current track time; written by the callback (or the seek path)
    track_time: AtomicDouble,
    /// Real seconds' worth of samples produced so far; owned by the
    /// buffering thread between seeks
    warped_time: AtomicDouble,
}

impl PlaybackSchedule {
    pub fn new(
        t0: f64,
        t1: f64,
        options: &StartStreamOptions,
        recording: Option<&RecordingSchedule>,
    ) -> Self {
        // Warping an overdub recording would desynchronize it from the
        // captured audio, so the warp is dropped while capturing
        let warp = if recording.is_some() {
            None
        } else {
            options.warp.clone()
        };

        let mut t0 = t0;
        let mut t1 = t1;
        if let Some(recording) = recording {
            t0 -= recording.pre_roll();
            // Keep completion from firing before the desired recording
            // length has been captured
            t1 -= recording.latency_correction();
        }

        let mut mode = if options.looped {
            PlayMode::Looped
        } else {
            PlayMode::Straight
        };
        if let Some(scrub) = &options.scrubbing {
            // Scrubbing is not compatible with looping, recording, or a warp
            if recording.is_some()
                || mode == PlayMode::Looped
                || warp.is_some()
                || scrub.max_speed < MIN_SCRUB_SPEED
            {
                log::warn!("scrub options ignored: incompatible stream configuration");
            } else if scrub.play_at_speed {
                mode = PlayMode::AtSpeed;
            } else {
                mode = PlayMode::Scrub;
            }
        }

        let (gap_start, gap_len) = options.cut_preview_gap.unwrap_or((-1.0, -1.0));

        let mut schedule = Self {
            t0,
            t1,
            mode,
            warp,
            warped_length: 0.0,
            cut_preview_gap_start: gap_start,
            cut_preview_gap_len: gap_len,
            track_time: AtomicDouble::new(t0),
            warped_time: AtomicDouble::new(0.0),
        };
        if !schedule.scrubbing() {
            schedule.warped_length = schedule.real_duration(t1);
        }
        schedule
    }

    pub fn t0(&self) -> f64 {
        self.t0
    }

    pub fn t1(&self) -> f64 {
        self.t1
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    pub fn looping(&self) -> bool {
        self.mode == PlayMode::Looped
    }

    pub fn scrubbing(&self) -> bool {
        self.mode == PlayMode::Scrub
    }

    pub fn playing_at_speed(&self) -> bool {
        self.mode == PlayMode::AtSpeed
    }

    /// Gesture-driven modes, where position comes from the scrub queue
    pub fn interactive(&self) -> bool {
        self.scrubbing() || self.playing_at_speed()
    }

    pub fn playing_straight(&self) -> bool {
        self.mode == PlayMode::Straight
    }

    pub fn reversed_time(&self) -> bool {
        self.t1 < self.t0
    }

    pub fn track_time(&self) -> f64 {
        self.track_time.load()
    }

    pub fn set_track_time(&self, time: f64) {
        self.track_time.store(time);
    }

    /// Bound a track time into the selection, allowing for forward or
    /// backward play
    pub fn clamp_track_time(&self, track_time: f64) -> f64 {
        if self.reversed_time() {
            track_time.min(self.t0).max(self.t1)
        } else {
            track_time.max(self.t0).min(self.t1)
        }
    }

    /// Current track time bounded into the selection
    pub fn limit_track_time(&self) -> f64 {
        self.clamp_track_time(self.track_time())
    }

    /// Track time readout for display: clamped unless gesture-driven, and
    /// jumped over the cut-preview gap when one is declared
    pub fn normalize_track_time(&self) -> f64 {
        let mut absolute = if self.interactive() {
            self.track_time()
        } else {
            self.limit_track_time()
        };

        if self.cut_preview_gap_len > 0.0 && absolute > self.cut_preview_gap_start {
            absolute += self.cut_preview_gap_len;
        }

        absolute
    }

    /// True when `track_time` has crossed T1 in the direction of play
    pub fn overruns(&self, track_time: f64) -> bool {
        if self.reversed_time() {
            track_time <= self.t1
        } else {
            track_time >= self.t1
        }
    }

    /// True when the current pass has crossed the end of the selection.
    /// Never true while scrubbing (but may be while playing at speed).
    pub fn pass_is_complete(&self) -> bool {
        if self.scrubbing() {
            return false;
        }
        self.overruns(self.track_time())
    }

    /// Advance track time by one buffer period of real time. Called from
    /// the hardware callback; a no-op in gesture-driven modes, where the
    /// scrub queue's consumer supplies position instead.
    pub fn track_time_update(&self, real_elapsed: f64) {
        if self.interactive() {
            return;
        }

        let mut real_elapsed = real_elapsed;
        if self.reversed_time() {
            real_elapsed = -real_elapsed;
        }

        let mut time = self.track_time();
        if let Some(warp) = &self.warp {
            // Defense against a case that might keep the solve loop from
            // terminating
            if (self.t0 - self.t1).abs() < 1e-9 {
                self.set_track_time(self.t0);
                return;
            }

            let mut total: f64 = 0.0;
            let mut found_total = false;
            loop {
                let old_time = time;
                if found_total && real_elapsed.abs() > total.abs() {
                    // Avoid an unnecessary inverse solve
                    time = self.t1;
                } else {
                    time = warp.solve_warped_length(time, real_elapsed);
                }
                if self.looping() && self.overruns(time) {
                    // The part of the warp outside the loop must not
                    // influence the result
                    let delta = if found_total && old_time == self.t0 {
                        total
                    } else {
                        let delta = warp.warped_length(old_time, self.t1);
                        if old_time == self.t0 {
                            found_total = true;
                            total = delta;
                        }
                        delta
                    };
                    real_elapsed -= delta;
                    time = self.t0;
                } else {
                    break;
                }
            }
        } else {
            time += real_elapsed;

            // Wrap to start if looping; track time itself is not warped
            if self.looping() {
                while self.overruns(time) {
                    time -= self.t1 - self.t0;
                }
            }
        }
        self.set_track_time(time);
    }

    /// Real seconds consumed playing from T0 to `track_time1`
    pub fn real_duration(&self, track_time1: f64) -> f64 {
        let duration = match &self.warp {
            Some(warp) => warp.warped_length(self.t0, track_time1),
            None => track_time1 - self.t0,
        };
        duration.abs()
    }

    pub fn has_warp(&self) -> bool {
        self.warp.is_some()
    }

    /// Total real seconds one pass of the selection takes (0 while scrubbing)
    pub fn warped_length(&self) -> f64 {
        self.warped_length
    }

    /// Real seconds of production still owed for the current pass
    pub fn real_time_remaining(&self) -> f64 {
        self.warped_length - self.warped_time.load()
    }

    /// Record that `increment` real seconds' worth of samples were produced
    pub fn real_time_advance(&self, increment: f64) {
        self.warped_time.store(self.warped_time.load() + increment);
    }

    /// Reinitialize the accumulator after a seek to `track_time`
    pub fn real_time_init(&self, track_time: f64) {
        if self.scrubbing() {
            self.warped_time.store(0.0);
        } else {
            self.warped_time.store(self.real_duration(track_time));
        }
    }

    /// Reset the accumulator at a loop restart
    pub fn real_time_restart(&self) {
        self.warped_time.store(0.0);
    }

    /// Accumulated real seconds of production in the current pass
    pub fn warped_time(&self) -> f64 {
        self.warped_time.load()
    }
}
