//! The audio transport engine
//!
//! [`AudioTransport`] owns stream lifecycle: it validates the track set,
//! negotiates device configurations, builds the schedules and ring
//! buffers, spawns the buffering thread, and starts the hardware
//! callbacks. At most one transport stream runs at a time; a stream is
//! identified by a token so late queries against a stopped stream can be
//! recognized.
//!
//! Threading model while a stream runs:
//!
//! - the **owning thread** (wherever the transport lives) issues
//!   commands through a lock-free queue and never blocks the audio path;
//! - the **buffering thread** ([`crate::engine::fill`]) moves samples
//!   between track storage and the rings;
//! - the **hardware callbacks** ([`crate::engine::callback`]) are cpal's
//!   threads and touch only rings and atomics.
//!
//! Stopping is where the ordering matters: the hardware is torn down
//! first, then the buffering thread runs a final capture drain so the
//! tail of a recording is not lost, then sinks are finalized on the
//! buffering thread before it exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Sender};
use thiserror::Error;

use crate::audio::{
    build_input_stream, build_monitor_stream, build_output_stream, negotiate, resolve_device,
    supported_common_rates, supported_rates, AudioError, Direction, StreamHandle,
};
use crate::config::TransportSettings;
use crate::engine::callback::{
    CallbackChannel, InputCallbackState, Meters, OutputCallbackState, PLAYTHROUGH_CHANNELS,
};
use crate::engine::clock::StreamClock;
use crate::engine::command::{command_channel, dropout_channel, LostInterval, TransportCommand};
use crate::engine::fill::{self, CaptureChannel, FillMessage, FillState, PlaybackChannel};
use crate::engine::mixer::TrackMixer;
use crate::engine::ring_buffer::RingBuffer;
use crate::engine::track::{CaptureSink, NullRealtimeEffects, PlaybackTrack, RealtimeEffects};
use crate::schedule::playback::{PlaybackSchedule, StartStreamOptions};
use crate::schedule::recording::RecordingSchedule;
use crate::schedule::scrub::{ScrubQueue, ScrubbingOptions};
use crate::types::{SampleFormat, BAD_STREAM_TIME};

/// Seconds of playback audio kept buffered ahead of the callback
const PLAYBACK_RING_SECS: f64 = 10.0;

/// Most seconds of playback mixed per fill pass (scrubbing substitutes
/// the gesture refresh period)
const MAX_PLAYBACK_SECS_TO_COPY: f64 = 4.0;

/// Smallest ring the allocation-halving retry will accept
const MIN_BUFFER_SAMPLES: usize = 100;

/// Capacity of the playthrough bridge, in seconds of stereo audio
const PLAYTHROUGH_RING_SECS: f64 = 1.0;

/// Backlog ceiling for the scrub queue's debt throttle, in seconds
const SCRUB_MAX_DEBT_SECS: f64 = 2.0;

/// Bound on the startup handshake with the buffering thread
const PRIME_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the final capture drain at stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a seek acknowledgement
const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

/// Cross-thread stream state, shared by the owning thread, the buffering
/// thread, and the hardware callbacks
#[derive(Debug, Default)]
pub struct StreamFlags {
    /// Stream is running; cleared first thing at stop
    pub stream_active: AtomicBool,
    /// Transport suspended; callbacks emit silence and count pause time
    pub paused: AtomicBool,
    /// Capture storage failed; fill passes skip capture until stop
    pub recording_exception: AtomicBool,
    /// A seek wants the playback rings emptied; only the output callback
    /// may do it, and clears the flag when done
    pub drain_rings: AtomicBool,
    /// Playback exhausted its schedule; callbacks freeze until stop
    pub stream_complete: AtomicBool,
    /// Capture samples replaced with silence because a ring was full
    pub lost_samples: AtomicU64,
}

/// Host hooks for transport lifecycle events. Every method defaults to a
/// no-op; implement the ones the host cares about.
pub trait TransportListener: Send + Sync {
    /// A stream was started or re-negotiated at this rate
    fn on_rate_changed(&self, _rate: f64) {}

    /// A capturing stream started
    fn on_recording_start(&self) {}

    /// A capturing stream stopped and its sinks were finalized
    fn on_recording_stop(&self) {}

    /// A capture sink started a new storage block; hosts checkpoint
    /// crash-recovery state on this
    fn on_new_recording_blocks(&self) {}

    /// Playback became active or inactive
    fn on_playback(&self, _active: bool) {}

    /// Capture became active or inactive
    fn on_capture(&self, _active: bool) {}
}

/// What a MIDI layer gets to schedule against: the clock correlation and
/// the shared position
pub struct MidiSyncContext {
    pub clock: Arc<StreamClock>,
    pub schedule: Arc<PlaybackSchedule>,
}

/// Transport-side interface to an optional MIDI playback layer
///
/// The transport drives lifecycle; the layer owns its own dispatch
/// thread and timing. `output_complete` is called from the hardware
/// callback, so implementations keep it wait-free.
pub trait MidiSync: Send + Sync {
    /// Stream is starting. Dispatch may begin once the context's clock
    /// reports its first frames.
    fn start(&self, context: &MidiSyncContext);

    fn set_paused(&self, paused: bool);

    /// Stream is stopping; silence everything and stop dispatch
    fn stop(&self);

    /// Audio playback exhausted its schedule; remaining MIDI should play
    /// out and then finish
    fn output_complete(&self);

    /// True when at least one sequence is loaded to play
    fn has_tracks(&self) -> bool;
}

/// Strategy object for streams with no MIDI layer
#[derive(Debug, Default)]
pub struct NullMidiSync;

impl MidiSync for NullMidiSync {
    fn start(&self, _context: &MidiSyncContext) {}

    fn set_paused(&self, _paused: bool) {}

    fn stop(&self) {}

    fn output_complete(&self) {}

    fn has_tracks(&self) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("a stream is already active")]
    StreamActive,

    #[error("no active stream")]
    NoStream,

    #[error("no tracks to play or record")]
    NoTracks,

    #[error("capture device offers {available} channels, need {needed}")]
    NotEnoughChannels { needed: usize, available: usize },

    #[error("could not allocate stream buffers ({0} samples is too few)")]
    BufferTooSmall(usize),

    #[error("seek is unavailable while scrubbing")]
    SeekWhileScrubbing,

    #[error("could not spawn the buffering thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("the buffering thread is not responding")]
    ThreadUnresponsive,
}

/// One channel of capture: the sink samples land in, plus the storage
/// format tag its ring carries
pub struct CaptureTrack {
    pub sink: Box<dyn CaptureSink>,
    pub format: SampleFormat,
}

impl CaptureTrack {
    pub fn new(sink: Box<dyn CaptureSink>, format: SampleFormat) -> Self {
        Self { sink, format }
    }
}

/// Everything one stream plays and records
#[derive(Default)]
pub struct TransportTracks {
    pub playback: Vec<PlaybackTrack>,
    pub capture: Vec<CaptureTrack>,
    /// MIDI layer started and stopped with the stream
    pub midi: Option<Arc<dyn MidiSync>>,
    /// Realtime effects applied by the hardware callback
    pub effects: Option<Box<dyn RealtimeEffects>>,
}

struct RingAllocation {
    playback: Vec<Arc<RingBuffer>>,
    capture: Vec<Arc<RingBuffer>>,
    /// Possibly reduced along with the ring sizes
    samples_to_copy: usize,
}

fn try_allocate(
    playback_tracks: usize,
    capture_formats: &[SampleFormat],
    playback_size: usize,
    capture_size: usize,
) -> Option<(Vec<Arc<RingBuffer>>, Vec<Arc<RingBuffer>>)> {
    let mut playback = Vec::with_capacity(playback_tracks);
    for _ in 0..playback_tracks {
        playback.push(Arc::new(RingBuffer::try_new(SampleFormat::Float, playback_size)?));
    }
    let mut capture = Vec::with_capacity(capture_formats.len());
    for &format in capture_formats {
        capture.push(Arc::new(RingBuffer::try_new(format, capture_size)?));
    }
    Some((playback, capture))
}

/// Allocate the stream rings, halving the request on failure until it
/// fits in memory or gets uselessly small
fn allocate_stream_rings(
    playback_tracks: usize,
    capture_formats: &[SampleFormat],
    mut playback_size: usize,
    mut capture_size: usize,
    mut samples_to_copy: usize,
) -> Result<RingAllocation, TransportError> {
    loop {
        if let Some((playback, capture)) =
            try_allocate(playback_tracks, capture_formats, playback_size, capture_size)
        {
            return Ok(RingAllocation {
                playback,
                capture,
                samples_to_copy,
            });
        }

        playback_size /= 2;
        capture_size /= 2;
        samples_to_copy = (samples_to_copy / 2).max(1);

        if (playback_tracks > 0 && playback_size < MIN_BUFFER_SAMPLES)
            || (!capture_formats.is_empty() && capture_size < MIN_BUFFER_SAMPLES)
        {
            return Err(TransportError::BufferTooSmall(
                playback_size.min(capture_size),
            ));
        }
        log::warn!("stream buffer allocation failed, retrying at {playback_size} samples");
    }
}

/// Coalesce back-to-back dropout records into single intervals
fn merge_intervals(raw: impl Iterator<Item = LostInterval>) -> Vec<LostInterval> {
    let mut merged: Vec<LostInterval> = Vec::new();
    for interval in raw {
        match merged.last_mut() {
            Some(last) if (last.start + last.duration - interval.start).abs() < 1e-6 => {
                last.duration += interval.duration;
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Everything belonging to the currently running stream
struct ActiveStream {
    token: u64,
    rate: f64,
    clock: Arc<StreamClock>,
    schedule: Arc<PlaybackSchedule>,
    flags: Arc<StreamFlags>,
    meters: Arc<Meters>,
    scrub_queue: Option<Arc<ScrubQueue>>,
    commands: rtrb::Producer<TransportCommand>,
    dropouts: rtrb::Consumer<LostInterval>,
    fill_control: Sender<FillMessage>,
    fill_thread: Option<JoinHandle<()>>,
    output: Option<StreamHandle>,
    input: Option<StreamHandle>,
    midi: Arc<dyn MidiSync>,
    has_playback: bool,
    has_capture: bool,
}

/// An input stream kept open for level monitoring, outside any transport
struct MonitorStream {
    rate: f64,
    meters: Arc<Meters>,
    _input: StreamHandle,
    _output: Option<StreamHandle>,
}

/// The transport engine. One per application; owns the active stream.
///
/// Not `Send`: cpal stream handles are thread-bound, so the transport
/// lives on whichever thread creates it (normally the UI thread) and
/// other threads reach the stream through the shared atomics.
pub struct AudioTransport {
    settings: TransportSettings,
    listener: Option<Arc<dyn TransportListener>>,
    active: Option<ActiveStream>,
    monitor: Option<MonitorStream>,
    next_token: u64,
    /// Best-rate memo, cleared when devices change
    cached_best_rate: Option<((bool, bool, u64), Option<f64>)>,
    /// Dropout intervals of the most recently stopped stream
    lost_intervals: Vec<LostInterval>,
}

impl AudioTransport {
    pub fn new(settings: TransportSettings, listener: Option<Arc<dyn TransportListener>>) -> Self {
        Self {
            settings,
            listener,
            active: None,
            monitor: None,
            next_token: 0,
            cached_best_rate: None,
            lost_intervals: Vec::new(),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Replace the settings (after a configuration reload). Takes effect
    /// at the next stream start.
    pub fn update_settings(&mut self, settings: TransportSettings) {
        self.settings = settings;
        self.cached_best_rate = None;
    }

    /// Start a stream over `[t0, t1]` with the given tracks. Returns the
    /// stream token on success.
    pub fn start_stream(
        &mut self,
        tracks: TransportTracks,
        t0: f64,
        t1: f64,
        mut options: StartStreamOptions,
    ) -> Result<u64, TransportError> {
        if self.active.is_some() {
            return Err(TransportError::StreamActive);
        }

        let midi: Arc<dyn MidiSync> = tracks
            .midi
            .clone()
            .unwrap_or_else(|| Arc::new(NullMidiSync));
        let has_playback = !tracks.playback.is_empty();
        let has_capture = !tracks.capture.is_empty();
        let has_midi = midi.has_tracks();
        if !has_playback && !has_capture && !has_midi {
            return Err(TransportError::NoTracks);
        }

        // Monitoring borrows the capture device; the stream takes over
        self.monitor = None;

        let rate = options.rate;
        let settings = &self.settings;
        // MIDI-only playback still opens an output stream: the hardware
        // callback is the timing source
        let want_output = has_playback
            || (has_midi && !has_capture)
            || (has_capture && settings.playthrough);
        let want_input = has_capture;

        let out_negotiated = if want_output {
            let device = resolve_device(settings.audio.playback_device.as_ref(), Direction::Playback)?;
            let (config, format) =
                negotiate_exact(&device, Direction::Playback, rate, 2, settings)?;
            Some((device, config, format))
        } else {
            None
        };
        let in_negotiated = if want_input {
            let device = resolve_device(settings.audio.capture_device.as_ref(), Direction::Capture)?;
            let (config, format) =
                negotiate_exact(&device, Direction::Capture, rate, tracks.capture.len() as u16, settings)?;
            if (config.channels as usize) < tracks.capture.len() {
                return Err(TransportError::NotEnoughChannels {
                    needed: tracks.capture.len(),
                    available: config.channels as usize,
                });
            }
            Some((device, config, format))
        } else {
            None
        };
        let output_channels = out_negotiated
            .as_ref()
            .map_or(0, |(_, config, _)| config.channels as usize);
        let input_channels = in_negotiated
            .as_ref()
            .map_or(0, |(_, config, _)| config.channels as usize);

        // Schedules. The latency correction default comes from settings;
        // a nonzero value in the options overrides it.
        let latency_correction = if options.latency_correction != 0.0 {
            options.latency_correction
        } else {
            settings.latency_correction_ms / 1000.0
        };
        let recording = has_capture.then(|| {
            Arc::new(RecordingSchedule::new(
                options.pre_roll,
                latency_correction,
                t1 - t0,
                std::mem::take(&mut options.crossfade_data),
            ))
        });
        let schedule = Arc::new(PlaybackSchedule::new(t0, t1, &options, recording.as_deref()));
        let clock = Arc::new(StreamClock::new(schedule.t0(), rate, settings.clock));
        if let Some(frames) = settings.audio.buffer_size.as_frames() {
            clock.set_reported_latency(frames as f64 / rate);
        }
        let flags = Arc::new(StreamFlags::default());

        // The schedule quietly downgrades an incompatible scrub request,
        // so gate the queue on what the schedule decided
        let scrub_queue = if schedule.interactive() {
            options.scrubbing.as_ref().map(|scrub| {
                Arc::new(ScrubQueue::new(
                    t0,
                    t1,
                    rate,
                    (SCRUB_MAX_DEBT_SECS * rate) as i64,
                    Instant::now(),
                    scrub,
                ))
            })
        } else {
            None
        };

        // Ring sizing. Capture rings grow with the channel count because
        // every channel must wait for the slowest sink.
        let n = tracks.capture.len().min(16) as f64;
        let capture_ring_secs = 4.5 + 0.5 * n;
        let min_capture_secs = 0.2 + 0.2 * n;
        let chunk_secs = match &options.scrubbing {
            Some(scrub) if schedule.interactive() && scrub.delay > 0.0 => scrub.delay,
            _ => MAX_PLAYBACK_SECS_TO_COPY,
        };
        let capture_formats: Vec<SampleFormat> =
            tracks.capture.iter().map(|track| track.format).collect();
        let rings = allocate_stream_rings(
            tracks.playback.len(),
            &capture_formats,
            (PLAYBACK_RING_SECS * rate) as usize,
            (capture_ring_secs * rate) as usize,
            ((chunk_secs * rate) as usize).max(1),
        )?;
        let samples_to_copy = rings.samples_to_copy;

        let mut effects = tracks
            .effects
            .unwrap_or_else(|| Box::new(NullRealtimeEffects));
        effects.initialize(rate);
        register_effect_groups(effects.as_mut(), &tracks.playback);

        let meters = Meters::new(input_channels, output_channels);
        let playthrough = (want_input && want_output && settings.playthrough).then(|| {
            Arc::new(RingBuffer::new(
                SampleFormat::Float,
                ((PLAYTHROUGH_RING_SECS * rate) as usize).max(1) * PLAYTHROUGH_CHANNELS,
            ))
        });

        let (command_tx, command_rx) = command_channel();
        let (dropout_tx, dropout_rx) = dropout_channel();

        // Buffering state: mixers on the production side, callback
        // channels on the consumption side, sharing the rings
        let mixer_warp = if recording.is_some() || schedule.interactive() {
            None
        } else {
            options.warp.clone()
        };
        let mut fill_state = FillState::new(
            rate,
            samples_to_copy,
            min_capture_secs,
            Arc::clone(&schedule),
            recording.clone(),
            Arc::clone(&flags),
            self.listener.clone(),
        );
        let mut callback_channels = Vec::with_capacity(tracks.playback.len());
        let mut track_controls = Vec::with_capacity(tracks.playback.len());
        for (track, ring) in tracks.playback.into_iter().zip(rings.playback.iter()) {
            let PlaybackTrack {
                source,
                controls,
                channel,
            } = track;
            fill_state.playback.push(PlaybackChannel {
                mixer: TrackMixer::new(
                    source,
                    rate,
                    schedule.t0(),
                    schedule.t1(),
                    mixer_warp.clone(),
                    samples_to_copy,
                ),
                ring: Arc::clone(ring),
            });
            callback_channels.push(CallbackChannel {
                ring: Arc::clone(ring),
                controls: Arc::clone(&controls),
                channel,
            });
            track_controls.push(controls);
        }
        for (track, ring) in tracks.capture.into_iter().zip(rings.capture.iter()) {
            fill_state.capture.push(CaptureChannel {
                ring: Arc::clone(ring),
                sink: track.sink,
                resampler: None,
            });
        }
        fill_state.scrub_queue = scrub_queue.clone();

        if let Some(start) = options.start_time {
            let time = schedule.clamp_track_time(start);
            schedule.set_track_time(time);
            for channel in &mut fill_state.playback {
                channel.mixer.reposition(time);
            }
            schedule.real_time_init(time);
        }

        // The command consumer goes to the output callback; a
        // capture-only stream gives it to the input callback instead
        let (output_state, spare_commands) = match out_negotiated.as_ref() {
            Some((_, config, _)) => {
                let mut state = OutputCallbackState::new(
                    rate,
                    config.channels as usize,
                    Arc::clone(&schedule),
                    Arc::clone(&clock),
                    Arc::clone(&flags),
                    command_rx,
                    effects,
                    Arc::clone(&midi),
                    Arc::clone(&meters),
                );
                state.playback = callback_channels;
                state.track_controls = track_controls;
                state.scrub_queue = scrub_queue.clone();
                state.playthrough = playthrough.clone();
                (Some(state), None)
            }
            None => (None, Some(command_rx)),
        };
        let input_state = in_negotiated.as_ref().map(|(_, config, _)| {
            let mut state = InputCallbackState::new(
                rate,
                config.channels as usize,
                Arc::clone(&schedule),
                Arc::clone(&clock),
                Arc::clone(&flags),
                dropout_tx,
                Arc::clone(&meters),
                latency_correction,
            );
            state.capture = rings.capture.clone();
            state.drives_clock = !want_output;
            state.commands = spare_commands;
            state.playthrough = playthrough.clone();
            state.detect_dropouts = settings.detect_dropouts;
            state.detect_upstream_dropouts = settings.detect_upstream_dropouts;
            state
        });

        // The buffering thread pre-fills the rings before the hardware
        // starts. Scrub streams skip the handshake: their first pass
        // blocks until the UI supplies a gesture.
        let (fill_tx, fill_rx) = bounded(8);
        let fill_thread = std::thread::Builder::new()
            .name("capstan-fill".into())
            .spawn(move || fill::run(fill_state, fill_rx))?;
        if scrub_queue.is_none() {
            let (ack_tx, ack_rx) = bounded(1);
            fill_tx
                .send(FillMessage::Prime { ack: ack_tx })
                .map_err(|_| TransportError::ThreadUnresponsive)?;
            if ack_rx.recv_timeout(PRIME_TIMEOUT).is_err() {
                let _ = fill_tx.send(FillMessage::Shutdown);
                return Err(TransportError::ThreadUnresponsive);
            }
        }

        midi.start(&MidiSyncContext {
            clock: Arc::clone(&clock),
            schedule: Arc::clone(&schedule),
        });

        // Build and start the hardware; undo everything on failure
        flags.paused.store(false, Ordering::Relaxed);
        flags.stream_active.store(true, Ordering::Release);
        let started = (|| -> Result<(Option<StreamHandle>, Option<StreamHandle>), TransportError> {
            let mut output = None;
            if let (Some((device, config, format)), Some(state)) =
                (out_negotiated.as_ref(), output_state)
            {
                let handle =
                    build_output_stream(device, config, *format, state, settings.driver_time)?;
                handle.play()?;
                output = Some(handle);
            }
            let mut input = None;
            if let (Some((device, config, format)), Some(state)) =
                (in_negotiated.as_ref(), input_state)
            {
                let handle = build_input_stream(device, config, *format, state)?;
                handle.play()?;
                input = Some(handle);
            }
            Ok((output, input))
        })();
        let (output, input) = match started {
            Ok(handles) => handles,
            Err(err) => {
                flags.stream_active.store(false, Ordering::Release);
                midi.stop();
                let _ = fill_tx.send(FillMessage::Shutdown);
                if let Some(queue) = &scrub_queue {
                    queue.nudge();
                }
                let _ = fill_thread.join();
                return Err(err);
            }
        };

        self.next_token += 1;
        let token = self.next_token;
        log::info!(
            "stream {token} started: {} playback, {} capture, rate {rate:.0}",
            output_channels,
            input_channels
        );

        if let Some(listener) = &self.listener {
            listener.on_rate_changed(rate);
            if has_playback || has_midi {
                listener.on_playback(true);
            }
            if has_capture {
                listener.on_capture(true);
                listener.on_recording_start();
            }
        }

        self.active = Some(ActiveStream {
            token,
            rate,
            clock,
            schedule,
            flags,
            meters,
            scrub_queue,
            commands: command_tx,
            dropouts: dropout_rx,
            fill_control: fill_tx,
            fill_thread: Some(fill_thread),
            output,
            input,
            midi,
            has_playback: has_playback || has_midi,
            has_capture,
        });
        Ok(token)
    }

    /// Stop the active stream, drain the capture tail, and finalize
    /// sinks. Idempotent.
    pub fn stop_stream(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        log::info!("stream {} stopping", active.token);

        active.flags.stream_active.store(false, Ordering::Release);
        // A fill pass blocked in the scrub queue must wake up to see the
        // shutdown
        if let Some(queue) = &active.scrub_queue {
            queue.nudge();
        }
        active.midi.stop();

        // Tear down the hardware before draining so no new capture
        // arrives mid-drain
        active.output = None;
        active.input = None;

        if active.has_capture && !active.flags.recording_exception.load(Ordering::Relaxed) {
            let (ack_tx, ack_rx) = bounded(1);
            if active
                .fill_control
                .send(FillMessage::Prime { ack: ack_tx })
                .is_ok()
                && ack_rx.recv_timeout(DRAIN_TIMEOUT).is_err()
            {
                log::warn!("final capture drain timed out");
            }
        }

        let _ = active.fill_control.send(FillMessage::Shutdown);
        if let Some(thread) = active.fill_thread.take() {
            if thread.join().is_err() {
                log::warn!("buffering thread panicked during shutdown");
            }
        }

        let mut raw = Vec::new();
        while let Ok(interval) = active.dropouts.pop() {
            raw.push(interval);
        }
        self.lost_intervals = merge_intervals(raw.into_iter());
        let lost = active.flags.lost_samples.load(Ordering::Relaxed);
        if lost > 0 {
            log::warn!(
                "recording lost {lost} samples across {} intervals",
                self.lost_intervals.len()
            );
        }
        if active.flags.recording_exception.load(Ordering::Relaxed) {
            log::warn!("recording stopped early by a storage failure; partial take kept");
        }
        if let Some(queue) = &active.scrub_queue {
            let drops = queue.filler_drops();
            if drops > 0 {
                log::debug!("scrubbing dropped {drops} filler intervals");
            }
        }

        active.meters.reset();

        if let Some(listener) = &self.listener {
            if active.has_playback {
                listener.on_playback(false);
            }
            if active.has_capture {
                listener.on_capture(false);
                listener.on_recording_stop();
            }
        }
        log::info!("stream {} stopped", active.token);
    }

    /// Suspend or resume the transport. Takes effect at the next
    /// hardware buffer.
    pub fn set_paused(&mut self, paused: bool) {
        if let Some(active) = &mut self.active {
            if active
                .commands
                .push(TransportCommand::SetPaused(paused))
                .is_err()
            {
                // Queue full means no callback is draining (stream
                // stalled); the flag write is safe from any thread
                active.flags.paused.store(paused, Ordering::Relaxed);
            }
            active.midi.set_paused(paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.flags.paused.load(Ordering::Relaxed))
    }

    /// Move playback by `delta` seconds, clamped into the selection.
    /// Works while paused; the result is audible on resume.
    pub fn seek_stream(&mut self, delta: f64) -> Result<(), TransportError> {
        let Some(active) = &self.active else {
            return Err(TransportError::NoStream);
        };
        if active.schedule.interactive() {
            return Err(TransportError::SeekWhileScrubbing);
        }

        let (ack_tx, ack_rx) = bounded(1);
        active
            .fill_control
            .send(FillMessage::Seek {
                delta,
                ack: ack_tx,
            })
            .map_err(|_| TransportError::ThreadUnresponsive)?;
        if ack_rx.recv_timeout(SEEK_TIMEOUT).is_err() {
            // The seek still lands when the thread catches up; the UI
            // just does not get to block on it
            log::warn!("seek not acknowledged within {SEEK_TIMEOUT:?}");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Scrubbing
    // ─────────────────────────────────────────────────────────────

    /// Append a scrub interval ending at a target time (or covering a
    /// speed, per the options). Returns false when no scrub stream is
    /// active or the queue rejected the request.
    pub fn enqueue_scrub(&self, end_or_speed: f64, options: &ScrubbingOptions) -> bool {
        match self.active.as_ref().and_then(|a| a.scrub_queue.as_ref()) {
            Some(queue) => queue.producer(end_or_speed, Instant::now(), options),
            None => false,
        }
    }

    /// End time of the most recently enqueued scrub interval
    pub fn last_scrub_time(&self) -> Option<f64> {
        self.active
            .as_ref()
            .and_then(|a| a.scrub_queue.as_ref())
            .map(|queue| queue.last_time_in_queue())
    }

    // ─────────────────────────────────────────────────────────────
    // Monitoring
    // ─────────────────────────────────────────────────────────────

    /// Open the capture device for level metering (and playthrough when
    /// enabled) without starting a transport
    pub fn start_monitoring(&mut self, rate: f64) -> Result<(), TransportError> {
        if self.active.is_some() {
            return Err(TransportError::StreamActive);
        }
        if self.monitor.is_some() {
            return Ok(());
        }
        let settings = &self.settings;

        let device = resolve_device(settings.audio.capture_device.as_ref(), Direction::Capture)?;
        let (config, format) = negotiate(
            &device,
            Direction::Capture,
            rate,
            1,
            settings.audio.buffer_size,
        )?;
        let channels = config.channels as usize;
        let actual_rate = config.sample_rate.0 as f64;

        let meters = Meters::new(channels, PLAYTHROUGH_CHANNELS);
        let options = StartStreamOptions {
            rate: actual_rate,
            ..Default::default()
        };
        let schedule = Arc::new(PlaybackSchedule::new(0.0, 0.0, &options, None));
        let clock = Arc::new(StreamClock::new(0.0, actual_rate, settings.clock));
        let flags = Arc::new(StreamFlags::default());
        let (dropout_tx, _dropout_rx) = dropout_channel();

        let playthrough = settings.playthrough.then(|| {
            Arc::new(RingBuffer::new(
                SampleFormat::Float,
                ((PLAYTHROUGH_RING_SECS * actual_rate) as usize).max(1) * PLAYTHROUGH_CHANNELS,
            ))
        });

        let mut state = InputCallbackState::new(
            actual_rate,
            channels,
            schedule,
            clock,
            flags,
            dropout_tx,
            Arc::clone(&meters),
            0.0,
        );
        state.playthrough = playthrough.clone();

        let input = build_input_stream(&device, &config, format, state)?;
        let output = match playthrough {
            Some(ring) => {
                let out_device =
                    resolve_device(settings.audio.playback_device.as_ref(), Direction::Playback)?;
                let (out_config, out_format) = negotiate(
                    &out_device,
                    Direction::Playback,
                    actual_rate,
                    2,
                    settings.audio.buffer_size,
                )?;
                Some(build_monitor_stream(
                    &out_device,
                    &out_config,
                    out_format,
                    ring,
                )?)
            }
            None => None,
        };

        input.play()?;
        if let Some(out) = &output {
            out.play()?;
        }
        log::info!("monitoring started at {actual_rate:.0} Hz");
        self.monitor = Some(MonitorStream {
            rate,
            meters,
            _input: input,
            _output: output,
        });
        Ok(())
    }

    pub fn stop_monitoring(&mut self) {
        if self.monitor.take().is_some() {
            log::info!("monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    // ─────────────────────────────────────────────────────────────
    // Rate negotiation
    // ─────────────────────────────────────────────────────────────

    /// Rates the configured devices support for the given directions,
    /// ascending; includes `desired` itself when the hardware accepts it
    pub fn supported_rates(
        &self,
        playing: bool,
        capturing: bool,
        desired: Option<f64>,
    ) -> Vec<f64> {
        let playback_device = || {
            resolve_device(
                self.settings.audio.playback_device.as_ref(),
                Direction::Playback,
            )
        };
        let capture_device = || {
            resolve_device(
                self.settings.audio.capture_device.as_ref(),
                Direction::Capture,
            )
        };
        match (playing, capturing) {
            (true, true) => match (playback_device(), capture_device()) {
                (Ok(playback), Ok(capture)) => {
                    supported_common_rates(&playback, &capture, desired)
                }
                _ => Vec::new(),
            },
            (true, false) => playback_device()
                .map(|device| supported_rates(&device, Direction::Playback, desired))
                .unwrap_or_default(),
            (false, true) => capture_device()
                .map(|device| supported_rates(&device, Direction::Capture, desired))
                .unwrap_or_default(),
            (false, false) => Vec::new(),
        }
    }

    /// Pick the rate to open a stream at: the desired rate when the
    /// hardware supports it, else the next higher supported rate, else
    /// the highest available. Memoized until a device change.
    pub fn get_best_rate(&mut self, playing: bool, capturing: bool, desired: f64) -> Option<f64> {
        if !playing && !capturing {
            return Some(desired);
        }
        let key = (playing, capturing, desired.to_bits());
        if let Some((cached_key, cached)) = &self.cached_best_rate {
            if *cached_key == key {
                return *cached;
            }
        }

        let rates = self.supported_rates(playing, capturing, Some(desired));
        let best = crate::audio::best_rate(&rates, desired);
        if best.is_none() {
            log::warn!("the selected devices support no usable sample rate");
        }
        self.cached_best_rate = Some((key, best));
        best
    }

    /// Devices changed (plugged, unplugged, or reconfigured): drop the
    /// rate memo and reopen monitoring. No-op while a stream runs.
    pub fn handle_device_change(&mut self) {
        if self.active.is_some() {
            return;
        }
        self.cached_best_rate = None;
        if let Some(monitor) = self.monitor.take() {
            let rate = monitor.rate;
            drop(monitor);
            if let Err(err) = self.start_monitoring(rate) {
                log::warn!("could not reopen monitoring after device change: {err}");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn is_stream_active(&self) -> bool {
        self.active.is_some()
    }

    /// True when `token` names the stream that is currently running
    pub fn is_token_active(&self, token: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.token == token)
    }

    /// Current playback position on the track timeline, with loop
    /// wrapping and the cut-preview gap applied. [`BAD_STREAM_TIME`]
    /// when no stream is active.
    pub fn stream_time(&self) -> f64 {
        match &self.active {
            Some(active) => active.schedule.normalize_track_time(),
            None => BAD_STREAM_TIME,
        }
    }

    /// Clock correlation of the active stream, for UIs and MIDI layers
    pub fn clock(&self) -> Option<Arc<StreamClock>> {
        self.active.as_ref().map(|a| Arc::clone(&a.clock))
    }

    pub fn stream_rate(&self) -> Option<f64> {
        self.active.as_ref().map(|a| a.rate)
    }

    /// Peak input levels since the last call, one per channel; empty
    /// when nothing is open
    pub fn input_levels(&self) -> Vec<f64> {
        if let Some(active) = &self.active {
            return active.meters.take_input_levels();
        }
        if let Some(monitor) = &self.monitor {
            return monitor.meters.take_input_levels();
        }
        Vec::new()
    }

    /// Peak output levels since the last call, one per channel
    pub fn output_levels(&self) -> Vec<f64> {
        match &self.active {
            Some(active) => active.meters.take_output_levels(),
            None => Vec::new(),
        }
    }

    /// Capture samples lost so far in the active stream
    pub fn lost_samples(&self) -> u64 {
        self.active
            .as_ref()
            .map_or(0, |a| a.flags.lost_samples.load(Ordering::Relaxed))
    }

    /// Dropout intervals recorded by the most recently stopped stream,
    /// latency-corrected track times. Draining, so a host labels each
    /// interval once.
    pub fn take_lost_intervals(&mut self) -> Vec<LostInterval> {
        std::mem::take(&mut self.lost_intervals)
    }

    // ─────────────────────────────────────────────────────────────
    // Track controls
    // ─────────────────────────────────────────────────────────────

    pub fn set_track_gain(&mut self, track: usize, gain: f32) {
        self.push_command(TransportCommand::SetGain { track, gain });
    }

    pub fn set_track_pan(&mut self, track: usize, pan: f32) {
        self.push_command(TransportCommand::SetPan { track, pan });
    }

    pub fn set_track_mute(&mut self, track: usize, muted: bool) {
        self.push_command(TransportCommand::SetMute { track, muted });
    }

    pub fn set_track_solo(&mut self, track: usize, soloed: bool) {
        self.push_command(TransportCommand::SetSolo { track, soloed });
    }

    fn push_command(&mut self, command: TransportCommand) {
        if let Some(active) = &mut self.active {
            if active.commands.push(command).is_err() {
                log::debug!("command queue full, dropped {command:?}");
            }
        }
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

fn negotiate_exact(
    device: &cpal::Device,
    direction: Direction,
    rate: f64,
    min_channels: u16,
    settings: &TransportSettings,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat), TransportError> {
    let (config, format) = negotiate(
        device,
        direction,
        rate,
        min_channels,
        settings.audio.buffer_size,
    )?;
    // Streams cannot run off-rate: the schedules and mixers were built
    // for `rate`. Callers negotiate a workable rate up front with
    // `get_best_rate`.
    if (config.sample_rate.0 as f64 - rate).abs() > 0.5 {
        return Err(AudioError::NoUsableConfig {
            direction: direction.noun().to_string(),
            requested: rate,
        }
        .into());
    }
    Ok((config, format))
}

/// Group consecutive playback tracks sharing controls (stereo pairs) and
/// register each group with the effects stage
fn register_effect_groups(effects: &mut dyn RealtimeEffects, playback: &[PlaybackTrack]) {
    let mut i = 0;
    while i < playback.len() {
        let mut width = 1;
        while width < 2
            && i + width < playback.len()
            && Arc::ptr_eq(&playback[i].controls, &playback[i + width].controls)
        {
            width += 1;
        }
        effects.add_group(width);
        i += width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;
    use crate::engine::track::{ChannelMap, MemoryPlaybackSource, TrackControls};

    fn transport() -> AudioTransport {
        AudioTransport::new(TransportSettings::default(), None)
    }

    #[test]
    fn test_start_requires_tracks() {
        let mut transport = transport();
        let result = transport.start_stream(
            TransportTracks::default(),
            0.0,
            1.0,
            StartStreamOptions::default(),
        );
        assert!(matches!(result, Err(TransportError::NoTracks)));
        assert!(!transport.is_stream_active());
    }

    #[test]
    fn test_idle_transport_queries() {
        let mut transport = transport();
        assert_eq!(transport.stream_time(), BAD_STREAM_TIME);
        assert!(!transport.is_token_active(0));
        assert!(!transport.is_token_active(1));
        assert!(!transport.is_paused());
        assert_eq!(transport.lost_samples(), 0);
        assert!(transport.input_levels().is_empty());
        assert!(transport.output_levels().is_empty());
        assert!(transport.take_lost_intervals().is_empty());
        assert!(matches!(
            transport.seek_stream(1.0),
            Err(TransportError::NoStream)
        ));
        // Control pushes with no stream are quietly ignored
        transport.set_paused(true);
        assert!(!transport.is_paused());
        transport.set_track_gain(0, 0.5);
        transport.stop_stream();
    }

    #[test]
    fn test_scrub_enqueue_without_stream() {
        let transport = transport();
        assert!(!transport.enqueue_scrub(1.0, &ScrubbingOptions::default()));
        assert!(transport.last_scrub_time().is_none());
    }

    #[test]
    fn test_best_rate_without_direction() {
        let mut transport = transport();
        assert_eq!(transport.get_best_rate(false, false, 44100.0), Some(44100.0));
    }

    #[test]
    fn test_ring_allocation_sizes() {
        let rings = allocate_stream_rings(2, &[SampleFormat::Int16], 4096, 2048, 1024).unwrap();
        assert_eq!(rings.playback.len(), 2);
        assert_eq!(rings.playback[0].capacity(), 4096);
        assert_eq!(rings.capture.len(), 1);
        assert_eq!(rings.capture[0].capacity(), 2048);
        assert_eq!(rings.capture[0].format(), SampleFormat::Int16);
        assert_eq!(rings.samples_to_copy, 1024);
    }

    #[test]
    fn test_ring_allocation_no_tracks() {
        let rings = allocate_stream_rings(0, &[], 0, 0, 1).unwrap();
        assert!(rings.playback.is_empty());
        assert!(rings.capture.is_empty());
    }

    #[test]
    fn test_merge_intervals_coalesces_adjacent() {
        let raw = vec![
            LostInterval {
                start: 1.0,
                duration: 0.5,
            },
            LostInterval {
                start: 1.5,
                duration: 0.25,
            },
            // Gap: stays separate
            LostInterval {
                start: 3.0,
                duration: 0.1,
            },
        ];
        let merged = merge_intervals(raw.into_iter());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].start, 1.0);
        assert!((merged[0].duration - 0.75).abs() < 1e-9);
        assert_eq!(merged[1].start, 3.0);
    }

    #[test]
    fn test_effect_groups_pair_shared_controls() {
        struct GroupRecorder(Vec<usize>);
        impl RealtimeEffects for GroupRecorder {
            fn initialize(&mut self, _rate: f64) {}
            fn add_group(&mut self, channels: usize) {
                self.0.push(channels);
            }
            fn process_start(&mut self) {}
            fn process(
                &mut self,
                _group: usize,
                _buffers: &mut [&mut [crate::types::Sample]],
                frames: usize,
            ) -> usize {
                frames
            }
            fn process_end(&mut self) {}
            fn finalize(&mut self) {}
        }

        let source = || Box::new(MemoryPlaybackSource::new(vec![0.0; 8], 44100.0));
        let pair = TrackControls::new();
        let playback = vec![
            PlaybackTrack::with_controls(source(), Arc::clone(&pair), ChannelMap::Left),
            PlaybackTrack::with_controls(source(), pair, ChannelMap::Right),
            PlaybackTrack::new(source(), ChannelMap::Mono),
        ];

        let mut recorder = GroupRecorder(Vec::new());
        register_effect_groups(&mut recorder, &playback);
        assert_eq!(recorder.0, vec![2, 1]);
    }

    #[test]
    fn test_listener_defaults_are_no_ops() {
        struct OnlyRate(std::sync::atomic::AtomicU64);
        impl TransportListener for OnlyRate {
            fn on_rate_changed(&self, rate: f64) {
                self.0.store(rate as u64, Ordering::Relaxed);
            }
        }

        let listener = OnlyRate(AtomicU64::new(0));
        listener.on_rate_changed(48000.0);
        listener.on_recording_start();
        listener.on_recording_stop();
        listener.on_new_recording_blocks();
        listener.on_playback(true);
        listener.on_capture(false);
        assert_eq!(listener.0.load(Ordering::Relaxed), 48000);
    }

    #[test]
    fn test_null_midi_sync() {
        let midi = NullMidiSync;
        assert!(!midi.has_tracks());
        midi.set_paused(true);
        midi.output_complete();
        midi.stop();
    }
}
