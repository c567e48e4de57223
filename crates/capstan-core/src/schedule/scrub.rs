//! Scrub work queue
//!
//! During scrub play, three threads coordinate through this queue with the
//! help of the playback ring buffers:
//!
//! - the UI thread specifies intervals to play ([`ScrubQueue::producer`]),
//! - the buffering thread consumes those specifications a first time and
//!   fills the ring buffers with samples ([`ScrubSession::transformer`]),
//! - the hardware callback drains the ring buffers, then consumes from
//!   this queue a second time to find out where the play indicator should
//!   be ([`ScrubQueue::consumer`]).
//!
//! The entry ring is partitioned by three indices, trailing <= middle <=
//! leading mod the ring size. The producer advances leading but never
//! catches up to trailing; the transformer advances middle up to (never
//! past) leading; the consumer advances trailing up to (never past)
//! middle. The buffering thread outruns the hardware callback by a
//! bounded amount because each enqueued interval covers a limited span of
//! real time, so a small fixed ring suffices.
//!
//! A debt/credit throttle in the transformer discards queued work when
//! the UI produces intervals faster than real time can play them, keeping
//! audible output synchronized with the user's gesture instead of lagging
//! ever further behind.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Intervals slower than this play as silence; mixers cannot resample
/// below it
pub const MIN_SCRUB_SPEED: f64 = 0.01;
/// Hard ceiling on interval speed, beyond any UI-selectable maximum
pub const MAX_SCRUB_SPEED: f64 = 32.0;

const QUEUE_SIZE: usize = 10;

/// Per-gesture scrub parameters, passed with every enqueue
#[derive(Debug, Clone)]
pub struct ScrubbingOptions {
    /// Seek semantics: adjust the interval's start toward the target
    /// rather than its end away from the start
    pub adjust_start: bool,
    /// Project bounds in samples at the stream rate
    pub min_sample: i64,
    pub max_sample: i64,
    /// Interpret enqueued values as speeds instead of target times
    pub by_speed: bool,
    /// Seconds between buffer refills while scrubbing
    pub delay: f64,
    /// Speed limits for one interval
    pub min_speed: f64,
    pub max_speed: f64,
    /// Shortest playback, in samples, worth making when following a fast
    /// gesture by skipping; shorter intervals are rejected outright
    pub min_stutter: i64,
    /// Time of the pointer movement that began the scrub
    pub start_clock_time: Option<Instant>,
    /// Sustained single-speed play rather than gesture following
    pub play_at_speed: bool,
}

impl Default for ScrubbingOptions {
    fn default() -> Self {
        Self {
            adjust_start: false,
            min_sample: 0,
            max_sample: i64::MAX,
            by_speed: false,
            delay: 0.0,
            min_speed: 0.0,
            max_speed: 1.0,
            min_stutter: 0,
            start_clock_time: None,
            play_at_speed: false,
        }
    }
}

/// One interval handed from the transformer to the buffering thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubSlice {
    pub start: i64,
    pub end: i64,
    /// Output samples this slice accounts for
    pub duration: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    s0: i64,
    s1: i64,
    /// Speed-clamped target; >= 0 means playback is still catching up to
    /// a stationary pointer
    goal: i64,
    /// Exactly this many samples of playback output correspond to this
    /// entry
    duration: i64,
    /// Grows from 0 to `duration` as the hardware callback catches up;
    /// equal means the entry can be discarded
    played: i64,
}

impl Entry {
    /// Derive the interval actually played from the requested one,
    /// clamping speed and bounds. `duration` is in/out: trimmed when the
    /// request cannot be honored in full. Returns false when the request
    /// must be dropped entirely.
    fn init(
        &mut self,
        previous: Option<&Entry>,
        s0: i64,
        s1: i64,
        duration: &mut i64,
        options: &ScrubbingOptions,
    ) -> bool {
        let adjust_start = options.adjust_start;
        debug_assert!(*duration > 0);

        let mut s0 = s0;
        let mut s1 = s1;
        let mut speed = (s1 - s0).abs() as f64 / *duration as f64;
        let mut adjusted_speed = false;

        let mut min_speed = options.min_speed.min(options.max_speed);

        if !adjust_start && speed > options.max_speed {
            // Reduce to the maximum speed selected in the UI
            speed = options.max_speed;
            self.goal = s1;
            adjusted_speed = true;
        } else if !adjust_start
            && previous.is_some_and(|prev| prev.goal >= 0 && prev.goal == s1)
        {
            // The pointer has not moved and playback is catching up to it
            // at maximum speed. Continue at no less than maximum; without
            // this the final catch-up becomes a slow interval that
            // audibly drops the pitch.
            min_speed = options.max_speed;
            self.goal = s1;
            adjusted_speed = true;
        } else {
            self.goal = -1;
        }

        if speed < min_speed {
            // Trim the duration
            *duration = ((speed * *duration as f64 / min_speed).round() as i64).max(0);
            speed = min_speed;
            adjusted_speed = true;
        }

        if speed < MIN_SCRUB_SPEED {
            // Mixers are set up to go only so slowly, not slower; this
            // turns the request into silence
            adjusted_speed = true;
            speed = 0.0;
        }

        if adjusted_speed && !adjust_start {
            // Move the end to match the adjusted speed
            let diff = (speed * *duration as f64).round() as i64;
            s1 = if s0 < s1 { s0 + diff } else { s0 - diff };
        }

        let mut silent = false;

        // Shorten again if the end lands out of bounds, or abandon a
        // stutter too short to be useful. The start is assumed in bounds
        // because it equals the previous interval's checked end.
        if s1 != s0 {
            let mut new_duration = *duration;
            let new_s1 = s1.clamp(options.min_sample, options.max_sample);
            if s1 != new_s1 {
                new_duration = ((*duration as f64 * (new_s1 - s0) as f64
                    / (s1 - s0) as f64) as i64)
                    .max(0);
            }
            if adjust_start && new_duration < options.min_stutter {
                return false;
            } else if new_duration == 0 {
                silent = true;
                s1 = s0;
            } else if s1 != new_s1 {
                *duration = new_duration;
                s1 = new_s1;
            }
        }

        if adjust_start && !silent {
            // Seeking: the target is authoritative, so move the start
            // back from it instead, limited by the speed ceiling
            let diff = (options.max_speed.min(speed) * *duration as f64).round() as i64;
            s0 = if s0 < s1 { s1 - diff } else { s1 + diff };
        }

        self.s0 = s0;
        self.s1 = s1;
        self.played = 0;
        self.duration = *duration;
        true
    }

    fn init_silent(&mut self, previous: &Entry, duration: i64) {
        self.goal = previous.goal;
        self.s0 = previous.s1;
        self.s1 = previous.s1;
        self.played = 0;
        self.duration = duration;
    }

    fn time(&self, rate: f64) -> f64 {
        if self.duration == 0 {
            // Abandoned by the debt throttle
            return self.s1 as f64 / rate;
        }
        (self.s0 as f64 + (self.s1 - self.s0) as f64 * self.played as f64 / self.duration as f64)
            / rate
    }
}

struct QueueState {
    entries: [Entry; QUEUE_SIZE],
    trailing: usize,
    middle: usize,
    leading: usize,
    /// Origin for converting enqueue wall-clock intervals into sample
    /// durations
    last_scrub_time: Instant,
    last_transformer_time: Option<Instant>,
    credit: i64,
    debt: i64,
    nudged: bool,
    filler_drops: u64,
}

pub struct ScrubQueue {
    rate: f64,
    /// Backlog ceiling for the debt throttle, in samples
    max_debt: i64,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ScrubQueue {
    pub fn new(
        t0: f64,
        t1: f64,
        rate: f64,
        max_debt: i64,
        now: Instant,
        options: &ScrubbingOptions,
    ) -> Self {
        let s0 = ((t0 * rate).round() as i64).clamp(options.min_sample, options.max_sample);
        let s1 = (t1 * rate).round() as i64;

        let origin = options.start_clock_time.unwrap_or(now);
        let mut state = QueueState {
            entries: [Entry::default(); QUEUE_SIZE],
            trailing: 0,
            middle: 1,
            leading: 1,
            last_scrub_time: origin,
            last_transformer_time: None,
            credit: 0,
            debt: 0,
            nudged: false,
            filler_drops: 0,
        };

        let mut duration =
            ((rate * now.duration_since(origin).as_secs_f64()) as i64).max(1);
        let mut entry = Entry::default();
        if entry.init(None, s0, s1, &mut duration, options) {
            state.entries[state.leading] = entry;
            state.leading += 1;
            state.last_scrub_time = now;
        }
        // On failure the origin stands, so the elapsed span is retried on
        // the next enqueue

        // Seed the trailing entry so the play indicator starts out
        // unconfused
        state.entries[state.trailing] = Entry {
            s0,
            s1: s0,
            goal: -1,
            duration: 1,
            played: 1,
        };

        Self {
            rate,
            max_debt,
            state: Mutex::new(state),
            available: Condvar::new(),
        }
    }

    /// End time of the most recently enqueued interval. Needed by the UI
    /// thread sometimes.
    pub fn last_time_in_queue(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let previous = &state.entries[(state.leading + QUEUE_SIZE - 1) % QUEUE_SIZE];
        previous.s1 as f64 / self.rate
    }

    /// Wake the buffering thread without supplying work; its next
    /// transformer call returns `None` instead of blocking. Used to
    /// unblock startup and shutdown handshakes.
    pub fn nudge(&self) {
        let mut state = self.state.lock().unwrap();
        state.nudged = true;
        self.available.notify_one();
    }

    /// Silent filler entries dropped because the ring was full; each drop
    /// makes the play indicator skip ahead briefly
    pub fn filler_drops(&self) -> u64 {
        self.state.lock().unwrap().filler_drops
    }

    /// UI thread: enqueue a scrubbing interval ending at a target time,
    /// or covering a speed, depending on `options.by_speed`. The interval
    /// starts where the previous one ended and spans the wall-clock time
    /// since the last enqueue. Returns false and drops the request when
    /// the ring is full or the derived interval is degenerate.
    pub fn producer(&self, end_or_speed: f64, now: Instant, options: &ScrubbingOptions) -> bool {
        // May advance leading, but never up to trailing
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let next = (state.leading + 1) % QUEUE_SIZE;
        if next == state.trailing {
            // The UI has outrun the hardware side; this request is lost
            return false;
        }

        let previous_idx = (state.leading + QUEUE_SIZE - 1) % QUEUE_SIZE;
        // The previous end is the new start
        let s0 = state.entries[previous_idx].s1;

        let orig_duration =
            (self.rate * now.duration_since(state.last_scrub_time).as_secs_f64()) as i64;
        if orig_duration <= 0 {
            state.last_scrub_time = now;
            return false;
        }

        let mut actual_duration = orig_duration;
        let s1 = if options.by_speed {
            s0 + (orig_duration as f64 * end_or_speed).round() as i64
        } else {
            (end_or_speed * self.rate).round() as i64
        };

        let mut entry = Entry::default();
        if !entry.init(
            Some(&state.entries[previous_idx]),
            s0,
            s1,
            &mut actual_duration,
            options,
        ) {
            return false;
        }
        state.entries[state.leading] = entry;
        state.leading = next;
        state.last_scrub_time = now;

        // Pad with silence when the interval was trimmed, so the queue
        // still accounts for all elapsed wall-clock time
        debug_assert!(actual_duration <= orig_duration);
        if actual_duration < orig_duration {
            let next = (state.leading + 1) % QUEUE_SIZE;
            if next != state.trailing {
                let previous = state.entries[(state.leading + QUEUE_SIZE - 1) % QUEUE_SIZE];
                state.entries[state.leading]
                    .init_silent(&previous, orig_duration - actual_duration);
                state.leading = next;
            } else {
                // Ring full: drop the filler and let the indicator skip
                state.filler_drops += 1;
                log::debug!(
                    "scrub queue full, dropped {} samples of filler silence",
                    orig_duration - actual_duration
                );
            }
        }

        drop(guard);
        self.available.notify_one();
        true
    }

    /// Open a transformer session for one buffering pass. The queue lock
    /// is taken on the first `transformer` call and held until the
    /// session is dropped; the debt check runs only on that first call.
    pub fn session(&self) -> ScrubSession<'_> {
        ScrubSession {
            queue: self,
            guard: None,
        }
    }

    /// Hardware callback: mark `frames` samples as played and return the
    /// track time of the play indicator, interpolated within the current
    /// trailing entry
    pub fn consumer(&self, frames: usize) -> f64 {
        // May advance trailing, but never up to middle
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        // It should not happen that frames exceed the total of samples to
        // be consumed; in that case the latest entry's end stands
        let mut frames = frames as i64;
        loop {
            let trailing = state.trailing;
            let entry = &mut state.entries[trailing];
            let remaining = entry.duration - entry.played;
            if frames >= remaining {
                frames -= remaining;
                entry.played = entry.duration;
            } else {
                entry.played += frames;
                break;
            }
            let next = (trailing + 1) % QUEUE_SIZE;
            if next == state.middle {
                break;
            }
            state.trailing = next;
        }
        state.entries[state.trailing].time(self.rate)
    }
}

/// Buffering-thread end of the queue for one fill pass
pub struct ScrubSession<'a> {
    queue: &'a ScrubQueue,
    guard: Option<MutexGuard<'a, QueueState>>,
}

impl ScrubSession<'_> {
    /// Block until an interval is available or a nudge arrives, then take
    /// the interval. `None` means a nudge, or that the debt throttle
    /// discarded everything that was queued.
    pub fn transformer(&mut self, now: Instant) -> Option<ScrubSlice> {
        // May advance middle, which may equal leading, but not pass it
        let check_debt = self.guard.is_none();
        let mut guard = match self.guard.take() {
            Some(guard) => guard,
            None => self.queue.state.lock().unwrap(),
        };

        while !guard.nudged && guard.middle == guard.leading {
            guard = self.queue.available.wait(guard).unwrap();
        }
        guard.nudged = false;

        let state = &mut *guard;

        if check_debt && state.last_transformer_time.is_some() && state.middle != state.leading
        {
            // Work is queued, but if the producer is outrunning us,
            // discard some. That may cause a skip, yet keeps playback
            // synchronized with the user's gesture.
            let last = state.last_transformer_time.unwrap();
            let interval = now.duration_since(last).as_secs_f64();
            // Samples owed over the interval, less samples delivered
            let deficit = (interval * self.queue.rate) as i64 - state.credit;
            state.credit = 0;
            state.debt += deficit;
            let mut to_discard = state.debt - self.queue.max_debt;
            while to_discard > 0 && state.middle != state.leading {
                let middle = state.middle;
                let entry = &mut state.entries[middle];
                if to_discard >= entry.duration {
                    // Discard the whole entry. Zero duration tells the
                    // consumer side to step over it.
                    state.debt -= entry.duration;
                    to_discard -= entry.duration;
                    entry.duration = 0;
                    state.middle = (middle + 1) % QUEUE_SIZE;
                } else {
                    // Shrink the entry from its start
                    let ratio = to_discard as f64 / entry.duration as f64;
                    let adjustment = ((entry.s1 - entry.s0).abs() as f64 * ratio) as i64;
                    if entry.s0 <= entry.s1 {
                        entry.s0 += adjustment;
                    } else {
                        entry.s0 -= adjustment;
                    }
                    state.debt -= to_discard;
                    entry.duration -= to_discard;
                    to_discard = 0;
                }
            }
        }

        let result = if state.middle != state.leading {
            // Work remains after debt cancellation
            let entry = state.entries[state.middle];
            state.middle = (state.middle + 1) % QUEUE_SIZE;
            state.credit += entry.duration;
            Some(ScrubSlice {
                start: entry.s0,
                end: entry.s1,
                duration: entry.duration,
            })
        } else {
            // Nudged awake, or everything queued was discarded
            None
        };

        if check_debt {
            state.last_transformer_time = Some(now);
        }

        self.guard = Some(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const RATE: f64 = 1000.0;

    fn options() -> ScrubbingOptions {
        ScrubbingOptions {
            max_sample: 10_000_000,
            ..Default::default()
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_speed_clamp_and_filler() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            min_speed: 0.5,
            max_speed: 1.0,
            ..options()
        };
        let queue = ScrubQueue::new(0.0, 0.0, RATE, 100, base + ms(100), &opts);

        // Target far beyond max speed: end is pulled in, no trimming
        assert!(queue.producer(2.0, base + ms(200), &opts));
        // Small move below min speed: duration trimmed, silence enqueued
        assert!(queue.producer(0.11, base + ms(300), &opts));
        assert!((queue.last_time_in_queue() - 0.11).abs() < 1e-9);

        let mut session = queue.session();
        let now = base + ms(300);
        // The initial zero-length gesture trims to nothing under min speed
        let first = session.transformer(now).unwrap();
        assert_eq!(first, ScrubSlice { start: 0, end: 0, duration: 0 });
        // Clamped to max speed 1.0: 100 samples cover 100 samples
        let second = session.transformer(now).unwrap();
        assert_eq!(second, ScrubSlice { start: 0, end: 100, duration: 100 });
        assert!((second.end - second.start).abs() <= second.duration);
        // Raised to min speed 0.5 by trimming: 10 samples in 20
        let third = session.transformer(now).unwrap();
        assert_eq!(third, ScrubSlice { start: 100, end: 110, duration: 20 });
        // The trimmed 80 samples come back as silence
        let filler = session.transformer(now).unwrap();
        assert_eq!(filler, ScrubSlice { start: 110, end: 110, duration: 80 });

        // The two enqueues account for all their wall-clock time: 200 ms
        // at 1 kHz
        assert_eq!(second.duration + third.duration + filler.duration, 200);
    }

    #[test]
    fn test_producer_fails_when_ring_full() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            by_speed: true,
            min_speed: 1.0,
            max_speed: 1.0,
            ..options()
        };
        let queue = ScrubQueue::new(0.0, 0.0, RATE, 100, base, &opts);

        // Exact-speed enqueues never trim, so each takes one slot; the
        // constructor used two
        let mut accepted = 0;
        for i in 1..=20u64 {
            if queue.producer(1.0, base + ms(100 * i), &opts) {
                accepted += 1;
            } else {
                break;
            }
        }
        assert_eq!(accepted, 7);
        assert!(!queue.producer(1.0, base + ms(10_000), &opts));
    }

    #[test]
    fn test_stutter_too_short_is_rejected() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            adjust_start: true,
            min_stutter: 50,
            max_speed: 1.0,
            max_sample: 1000,
            ..options()
        };
        let queue = ScrubQueue::new(0.99, 0.99, RATE, 100, base, &opts);

        // Target beyond the project end: bounds clamping shrinks the
        // interval below the stutter floor, so the request is dropped
        assert!(!queue.producer(2.0, base + ms(100), &opts));
        assert!((queue.last_time_in_queue() - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_goal_continuation_holds_max_speed() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            max_speed: 4.0,
            ..options()
        };
        let queue = ScrubQueue::new(9.5, 9.5, RATE, 100, base, &opts);

        // Fast gesture toward 10 s: clamped to 4x, goal remembered
        assert!(queue.producer(10.0, base + ms(100), &opts));
        // Pointer stays put; catching up continues at no less than max
        // speed, with the remainder filled by silence
        assert!(queue.producer(10.0, base + ms(200), &opts));

        let mut session = queue.session();
        let now = base + ms(200);
        let _initial = session.transformer(now).unwrap();
        let chase = session.transformer(now).unwrap();
        assert_eq!(chase, ScrubSlice { start: 9500, end: 9900, duration: 100 });
        let catch_up = session.transformer(now).unwrap();
        assert_eq!(catch_up, ScrubSlice { start: 9900, end: 10000, duration: 25 });
        let speed = (catch_up.end - catch_up.start) as f64 / catch_up.duration as f64;
        assert!((speed - 4.0).abs() < 1e-9);
        let filler = session.transformer(now).unwrap();
        assert_eq!(filler, ScrubSlice { start: 10000, end: 10000, duration: 75 });
    }

    #[test]
    fn test_debt_throttle_discards_stale_work() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            by_speed: true,
            max_speed: 1.0,
            ..options()
        };
        let queue = ScrubQueue::new(0.0, 0.0, RATE, 50, base, &opts);

        {
            // First pass primes the transformer's clock; no debt check yet
            let mut session = queue.session();
            let slice = session.transformer(base).unwrap();
            assert_eq!(slice.duration, 1);
        }

        assert!(queue.producer(1.0, base + ms(100), &opts));
        assert!(queue.producer(1.0, base + ms(200), &opts));

        // 200 ms owed (200 samples) against 1 delivered: 199 of debt, 149
        // over the ceiling. The first queued entry (100) is discarded
        // whole, the second shrunk from the front by 49.
        let mut session = queue.session();
        let slice = session.transformer(base + ms(200)).unwrap();
        assert_eq!(slice, ScrubSlice { start: 149, end: 200, duration: 51 });
        drop(session);

        // The consumer steps over the abandoned entry and interpolates
        // within the shrunken one (1 frame drains the constructor entry;
        // the pre-played seed and the abandoned entry consume none)
        let time = queue.consumer(1 + 9);
        assert!((time - (149.0 + 9.0) / RATE).abs() < 1e-9);
    }

    #[test]
    fn test_consumer_clamps_at_queue_end() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            max_speed: 1.0,
            ..options()
        };
        // Constructor enqueues 0..100 over 100 samples
        let queue = ScrubQueue::new(0.0, 0.1, RATE, 100, base + ms(100), &opts);

        let mut session = queue.session();
        session.transformer(base + ms(100)).unwrap();
        drop(session);

        // The pre-played seed entry consumes nothing; land halfway in
        let time = queue.consumer(50);
        assert!((time - 0.05).abs() < 1e-9);
        // Overshoot sticks at the interval's end
        let time = queue.consumer(1000);
        assert!((time - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_nudge_unblocks_empty_queue() {
        let base = Instant::now();
        let opts = ScrubbingOptions {
            start_clock_time: Some(base),
            ..options()
        };
        let queue = Arc::new(ScrubQueue::new(0.0, 0.0, RATE, 100, base, &opts));

        let nudger = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(ms(50));
                queue.nudge();
            })
        };

        let mut session = queue.session();
        // Drain the constructor's entry, then block until the nudge
        assert!(session.transformer(base).is_some());
        assert!(session.transformer(base).is_none());
        drop(session);
        nudger.join().unwrap();
    }
}
