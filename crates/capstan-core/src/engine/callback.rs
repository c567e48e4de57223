//! Hardware callback core
//!
//! The per-buffer processing behind the device streams, kept separate
//! from stream construction so it can be driven directly by tests. Output
//! and input run as distinct callbacks (the backend opens one stream per
//! direction), coordinating through shared atomics:
//!
//! - [`OutputCallbackState`] drains the command channel, mixes playback
//!   rings into the interleaved device buffer with per-channel gain
//!   ramps, runs the realtime effects seam, detects pass completion, and
//!   advances track time.
//! - [`InputCallbackState`] un-interleaves device input into the capture
//!   rings, records dropouts, and feeds the input meter and the software
//!   playthrough ring.
//!
//! Rules for both: no locks, no logging, no unbounded waits. Anything
//! that must reach another thread goes through a ring or an atomic.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::clock::StreamClock;
use crate::engine::command::{LostInterval, TransportCommand};
use crate::engine::ring_buffer::RingBuffer;
use crate::engine::track::{ChannelMap, RealtimeEffects, TrackControls};
use crate::engine::transport::{MidiSync, StreamFlags};
use crate::schedule::playback::PlaybackSchedule;
use crate::schedule::scrub::ScrubQueue;
use crate::types::Sample;

/// Scratch capacity per channel, sized past any plausible device buffer
/// so the callback never allocates
pub const MAX_SCRATCH_FRAMES: usize = 8192;

/// The playthrough ring always carries stereo pairs, whatever the device
/// channel counts are
pub const PLAYTHROUGH_CHANNELS: usize = 2;

/// Per-channel peak levels for meter display, written by the callbacks
/// and read (and cleared) by the UI thread
pub struct Meters {
    input: Vec<crate::types::AtomicDouble>,
    output: Vec<crate::types::AtomicDouble>,
}

impl Meters {
    pub fn new(input_channels: usize, output_channels: usize) -> Arc<Self> {
        let peak = || crate::types::AtomicDouble::new(0.0);
        Arc::new(Self {
            input: (0..input_channels).map(|_| peak()).collect(),
            output: (0..output_channels).map(|_| peak()).collect(),
        })
    }

    fn update(levels: &[crate::types::AtomicDouble], interleaved: &[Sample], channels: usize) {
        for (channel, level) in levels.iter().enumerate().take(channels) {
            let mut peak = level.load();
            for frame in interleaved.chunks_exact(channels) {
                peak = peak.max(frame[channel].abs() as f64);
            }
            level.store(peak);
        }
    }

    /// Read and clear the input peaks
    pub fn take_input_levels(&self) -> Vec<f64> {
        self.input
            .iter()
            .map(|level| {
                let peak = level.load();
                level.store(0.0);
                peak
            })
            .collect()
    }

    /// Read and clear the output peaks
    pub fn take_output_levels(&self) -> Vec<f64> {
        self.output
            .iter()
            .map(|level| {
                let peak = level.load();
                level.store(0.0);
                peak
            })
            .collect()
    }

    pub fn reset(&self) {
        for level in self.input.iter().chain(self.output.iter()) {
            level.store(0.0);
        }
    }
}

/// Apply queued UI commands. Runs at the top of whichever callback owns
/// the consumer end.
fn apply_commands(
    commands: &mut rtrb::Consumer<TransportCommand>,
    track_controls: &[Arc<TrackControls>],
    flags: &StreamFlags,
) {
    while let Ok(command) = commands.pop() {
        match command {
            TransportCommand::SetPaused(paused) => {
                flags.paused.store(paused, Ordering::Relaxed);
            }
            TransportCommand::SetGain { track, gain } => {
                if let Some(controls) = track_controls.get(track) {
                    controls.set_gain(gain as f64);
                }
            }
            TransportCommand::SetPan { track, pan } => {
                if let Some(controls) = track_controls.get(track) {
                    controls.set_pan(pan as f64);
                }
            }
            TransportCommand::SetMute { track, muted } => {
                if let Some(controls) = track_controls.get(track) {
                    controls.set_mute(muted);
                }
            }
            TransportCommand::SetSolo { track, soloed } => {
                if let Some(controls) = track_controls.get(track) {
                    controls.set_solo(soloed);
                }
            }
        }
    }
}

/// One playback channel as the output callback sees it: the ring it
/// drains, the live controls, and where it lands in the interleave
pub struct CallbackChannel {
    pub ring: Arc<RingBuffer>,
    pub controls: Arc<TrackControls>,
    pub channel: ChannelMap,
}

pub struct OutputCallbackState {
    pub rate: f64,
    /// Hardware output interleave width
    pub channels: usize,
    pub playback: Vec<CallbackChannel>,
    pub schedule: Arc<PlaybackSchedule>,
    pub scrub_queue: Option<Arc<ScrubQueue>>,
    pub clock: Arc<StreamClock>,
    pub flags: Arc<StreamFlags>,
    pub commands: rtrb::Consumer<TransportCommand>,
    /// Command targets, indexed by the track numbers the UI uses
    pub track_controls: Vec<Arc<TrackControls>>,
    pub effects: Box<dyn RealtimeEffects>,
    pub midi: Arc<dyn MidiSync>,
    pub meters: Arc<Meters>,
    /// Consumer end of the playthrough ring, fed by the input callback
    pub playthrough: Option<Arc<RingBuffer>>,
    scratch: [Vec<Sample>; 2],
    playthrough_scratch: Vec<Sample>,
    complete_notified: bool,
}

impl OutputCallbackState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate: f64,
        channels: usize,
        schedule: Arc<PlaybackSchedule>,
        clock: Arc<StreamClock>,
        flags: Arc<StreamFlags>,
        commands: rtrb::Consumer<TransportCommand>,
        effects: Box<dyn RealtimeEffects>,
        midi: Arc<dyn MidiSync>,
        meters: Arc<Meters>,
    ) -> Self {
        Self {
            rate,
            channels,
            playback: Vec::new(),
            schedule,
            scrub_queue: None,
            clock,
            flags,
            commands,
            track_controls: Vec::new(),
            effects,
            midi,
            meters,
            playthrough: None,
            scratch: [
                Vec::with_capacity(MAX_SCRATCH_FRAMES),
                Vec::with_capacity(MAX_SCRATCH_FRAMES),
            ],
            playthrough_scratch: Vec::with_capacity(MAX_SCRATCH_FRAMES * PLAYTHROUGH_CHANNELS),
            complete_notified: false,
        }
    }

    /// One interleaved output buffer. `driver_delay` carries the
    /// driver-reported output delay when the clock configuration trusts
    /// it.
    pub fn process(&mut self, output: &mut [Sample], driver_delay: Option<f64>) {
        let channels = self.channels;
        let frames = output.len() / channels;

        apply_commands(&mut self.commands, &self.track_controls, &self.flags);

        // A seek asked for the stale ring contents to be dropped; only
        // this thread may move the read cursors. Serviced even while
        // paused, so a seek can land during a pause.
        if self.flags.drain_rings.load(Ordering::Acquire) {
            for channel in &self.playback {
                channel.ring.discard(channel.ring.capacity());
            }
            self.flags.drain_rings.store(false, Ordering::Release);
        }

        let paused = self.flags.paused.load(Ordering::Relaxed);
        let complete = self.flags.stream_complete.load(Ordering::Relaxed);
        self.clock.on_callback(frames, paused || complete, driver_delay);

        output.fill(0.0);

        if paused || complete {
            // Frozen transport: silence, optionally with live input
            // passed through
            if !complete {
                self.mix_playthrough(output, frames);
            }
            Meters::update(&self.meters.output, output, channels);
            return;
        }

        self.mix_playthrough(output, frames);

        self.effects.process_start();

        let num_solo = self
            .playback
            .iter()
            .filter(|channel| channel.controls.solo())
            .count();

        // Tracks arrive as consecutive channel runs sharing one controls
        // block; each run is one effects group
        let mut group = 0;
        let mut max_len = 0usize;
        let mut start = 0;
        while start < self.playback.len() {
            let controls = Arc::clone(&self.playback[start].controls);
            let mut count = 1;
            while start + count < self.playback.len()
                && Arc::ptr_eq(&self.playback[start + count].controls, &controls)
            {
                count += 1;
            }
            debug_assert!(count <= 2);

            let cut = (num_solo > 0 && !controls.solo())
                || (controls.mute() && !controls.solo());

            if cut {
                // Cut tracks still consume their frames so the rings
                // stay aligned with the others
                for channel in &self.playback[start..start + count] {
                    max_len = max_len.max(channel.ring.discard(frames));
                }
            } else {
                for (c, channel) in self.playback[start..start + count].iter().enumerate() {
                    let buf = &mut self.scratch[c];
                    buf.resize(frames, 0.0);
                    let got = channel.ring.get(&mut buf[..frames]);
                    // A short channel pads with silence; its partner may
                    // still be delivering
                    buf[got..frames].fill(0.0);
                    max_len = max_len.max(got);
                }

                let len = max_len;
                let processed = if count == 1 {
                    let mut bufs = [&mut self.scratch[0][..len]];
                    self.effects.process(group, &mut bufs, len)
                } else {
                    let (left, right) = self.scratch.split_at_mut(1);
                    let mut bufs = [&mut left[0][..len], &mut right[0][..len]];
                    self.effects.process(group, &mut bufs, len)
                };

                for (c, channel) in self.playback[start..start + count].iter().enumerate() {
                    let buf = &self.scratch[c];
                    if matches!(channel.channel, ChannelMap::Left | ChannelMap::Mono) {
                        add_to_output(output, channels, 0, &buf[..processed], &channel.controls);
                    }
                    if channels > 1
                        && matches!(channel.channel, ChannelMap::Right | ChannelMap::Mono)
                    {
                        add_to_output(output, channels, 1, &buf[..processed], &channel.controls);
                    }
                }
            }

            group += 1;
            self.check_completion(max_len);
            start += count;
        }

        if self.playback.is_empty() {
            // Recording-only streams still need the end-of-selection check
            self.check_completion(0);
        }

        self.effects.process_end();

        // While scrubbing, position comes from the queue's consumer side,
        // advanced by however much the rings actually delivered
        if self.schedule.interactive() {
            if let Some(queue) = &self.scrub_queue {
                self.schedule.set_track_time(queue.consumer(max_len));
            }
        }

        for sample in output.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        Meters::update(&self.meters.output, output, channels);

        self.schedule.track_time_update(frames as f64 / self.rate);
    }

    fn mix_playthrough(&mut self, output: &mut [Sample], frames: usize) {
        let Some(playthrough) = &self.playthrough else {
            return;
        };
        let want = frames * PLAYTHROUGH_CHANNELS;
        self.playthrough_scratch.resize(want, 0.0);
        let got = playthrough.get(&mut self.playthrough_scratch[..want]);
        for i in 0..got / PLAYTHROUGH_CHANNELS {
            output[self.channels * i] += self.playthrough_scratch[PLAYTHROUGH_CHANNELS * i];
            if self.channels > 1 {
                output[self.channels * i + 1] +=
                    self.playthrough_scratch[PLAYTHROUGH_CHANNELS * i + 1];
            }
        }
    }

    fn check_completion(&mut self, len: usize) {
        let mut done = self.schedule.pass_is_complete();
        if done {
            // Straight play drains its rings to the last sample before
            // finishing; at-speed play may abandon a remainder
            done = self.schedule.playing_at_speed()
                || (self.schedule.playing_straight() && len == 0);
        }
        if done && !self.complete_notified {
            self.complete_notified = true;
            self.midi.output_complete();
            self.flags.stream_complete.store(true, Ordering::Release);
        }
    }
}

/// Ramp one channel's samples into the interleaved output, moving gain
/// linearly from the value that ended the previous buffer to the current
/// target. The ramp keeps fader moves from stepping audibly.
fn add_to_output(
    output: &mut [Sample],
    channels: usize,
    channel: usize,
    buf: &[Sample],
    controls: &TrackControls,
) {
    if buf.is_empty() {
        return;
    }
    let gain = controls.channel_gain(channel);
    let old = controls.old_gain(channel);
    let step = (gain - old) / buf.len() as f64;
    for (i, &sample) in buf.iter().enumerate() {
        let ramped = old + step * (i + 1) as f64;
        output[channels * i + channel] += (ramped * sample as f64) as Sample;
    }
    controls.set_old_gain(channel, gain);
}

pub struct InputCallbackState {
    pub rate: f64,
    /// Hardware input interleave width
    pub channels: usize,
    pub capture: Vec<Arc<RingBuffer>>,
    pub schedule: Arc<PlaybackSchedule>,
    pub clock: Arc<StreamClock>,
    /// True when no output stream exists to advance the clock
    pub drives_clock: bool,
    pub flags: Arc<StreamFlags>,
    /// Present on capture-only streams, which have no output callback to
    /// drain the command channel
    pub commands: Option<rtrb::Consumer<TransportCommand>>,
    pub dropouts: rtrb::Producer<LostInterval>,
    pub meters: Arc<Meters>,
    /// Producer end of the playthrough ring
    pub playthrough: Option<Arc<RingBuffer>>,
    pub latency_correction: f64,
    pub detect_dropouts: bool,
    pub detect_upstream_dropouts: bool,
    scratch: Vec<Sample>,
}

impl InputCallbackState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate: f64,
        channels: usize,
        schedule: Arc<PlaybackSchedule>,
        clock: Arc<StreamClock>,
        flags: Arc<StreamFlags>,
        dropouts: rtrb::Producer<LostInterval>,
        meters: Arc<Meters>,
        latency_correction: f64,
    ) -> Self {
        Self {
            rate,
            channels,
            capture: Vec::new(),
            schedule,
            clock,
            drives_clock: false,
            flags,
            commands: None,
            dropouts,
            meters,
            playthrough: None,
            latency_correction,
            detect_dropouts: false,
            detect_upstream_dropouts: false,
            scratch: Vec::with_capacity(MAX_SCRATCH_FRAMES * PLAYTHROUGH_CHANNELS),
        }
    }

    /// One interleaved input buffer. `overflowed` reflects a driver
    /// overflow report for this buffer, when the backend surfaces one.
    pub fn process(&mut self, input: &[Sample], overflowed: bool) {
        let channels = self.channels;
        let frames = input.len() / channels;

        if let Some(commands) = &mut self.commands {
            apply_commands(commands, &[], &self.flags);
        }

        let paused = self.flags.paused.load(Ordering::Relaxed);
        if self.drives_clock {
            self.clock.on_callback(frames, paused, None);
        }

        // Meters stay live while paused; monitoring is their whole point
        Meters::update(&self.meters.input, input, channels);

        if let Some(playthrough) = &self.playthrough {
            // Always stereo pairs; mono input duplicates, wider input
            // contributes its first two channels
            self.scratch.resize(frames * PLAYTHROUGH_CHANNELS, 0.0);
            for i in 0..frames {
                let left = input[channels * i];
                let right = if channels > 1 {
                    input[channels * i + 1]
                } else {
                    left
                };
                self.scratch[PLAYTHROUGH_CHANNELS * i] = left;
                self.scratch[PLAYTHROUGH_CHANNELS * i + 1] = right;
            }
            playthrough.put(&self.scratch[..frames * PLAYTHROUGH_CHANNELS]);
        }

        // Monitoring streams carry no capture rings; paused or completed
        // transports stop consuming input
        if self.capture.is_empty()
            || paused
            || self.flags.stream_complete.load(Ordering::Relaxed)
        {
            return;
        }

        let mut len = frames;
        for ring in &self.capture {
            len = len.min(ring.avail_for_put());
        }

        // A short `len` means the buffering thread is not draining fast
        // enough (storage too slow, or CPU-bound); an overflow report
        // means the driver itself dropped input
        if self.detect_dropouts && ((self.detect_upstream_dropouts && overflowed) || len < frames)
        {
            let start =
                self.schedule.track_time() + len as f64 / self.rate + self.latency_correction;
            let duration = (frames - len) as f64 / self.rate;
            // A full record channel loses the label, never blocks
            let _ = self.dropouts.push(LostInterval { start, duration });
        }
        if len < frames {
            self.flags
                .lost_samples
                .fetch_add((frames - len) as u64, Ordering::Relaxed);
        }

        if len > 0 {
            for (t, ring) in self.capture.iter().enumerate() {
                self.scratch.resize(len, 0.0);
                for i in 0..len {
                    self.scratch[i] = input[channels * i + t];
                }
                ring.put(&self.scratch[..len]);
            }
        }
    }
}
