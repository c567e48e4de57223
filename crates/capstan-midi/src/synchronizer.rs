//! Dispatch engine synchronizing MIDI playback to the audio transport
//!
//! [`MidiOutputSynchronizer`] implements the transport's `MidiSync`
//! seam. `start` spawns a dispatch thread that wakes every
//! [`MIDI_SLEEP`], converts events falling inside its lookahead window
//! to wire messages, and queues them on a [`TimedMidiOutput`] with
//! millisecond timestamps from the stream clock. Mute, solo, and
//! channel visibility are sampled live from track controls; offs for
//! sounding notes bypass the gate so nothing hangs.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use capstan_core::engine::{
    MidiSync, MidiSyncContext, StreamClock, MIDI_MINIMAL_LATENCY_MS,
};
use capstan_core::schedule::PlaybackSchedule;
use flume::RecvTimeoutError;
use midly::live::LiveEvent;
use midly::MidiMessage;

use crate::device::{self, TimedMidiOutput};
use crate::sequence::{MergedEvent, MergedIterator, MidiEventKind, MidiTrack};

/// Dispatch thread wakeup period
const MIDI_SLEEP: Duration = Duration::from_millis(10);
/// Scheduling slop covering the dispatch thread's wakeup jitter, in ms
const THREAD_LATENCY_MS: f64 = 5.0;
/// Pass-end sentinel sits this far before the horizon so its offs sort
/// ahead of the next pass
const HORIZON_EPSILON: f64 = 1e-6;
/// Hard cap on the close-time drain of timestamped messages
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Control {
    SetPaused(bool),
    Stop,
}

enum OutputSource {
    /// Resolve a hardware port when the stream starts
    Connect { port_match: Option<String> },
    /// Use a pre-built output (virtual ports, tests)
    Injected(Mutex<Option<TimedMidiOutput>>),
}

struct Dispatch {
    control: flume::Sender<Control>,
    thread: JoinHandle<()>,
}

/// Plays [`MidiTrack`]s against the transport clock
pub struct MidiOutputSynchronizer {
    tracks: Arc<Vec<MidiTrack>>,
    synth_latency_ms: f64,
    source: OutputSource,
    complete: Arc<AtomicBool>,
    audio_complete: Arc<AtomicBool>,
    dispatch: Mutex<Option<Dispatch>>,
}

impl MidiOutputSynchronizer {
    /// `synth_latency_ms` compensates the downstream synthesizer's own
    /// latency; events are scheduled that much earlier.
    pub fn new(tracks: Vec<MidiTrack>, synth_latency_ms: f64) -> Self {
        Self {
            tracks: Arc::new(tracks),
            synth_latency_ms,
            source: OutputSource::Connect { port_match: None },
            complete: Arc::new(AtomicBool::new(false)),
            audio_complete: Arc::new(AtomicBool::new(false)),
            dispatch: Mutex::new(None),
        }
    }

    /// Restrict port resolution to names containing `pattern`
    /// (case-insensitive)
    pub fn with_port_match(mut self, pattern: impl Into<String>) -> Self {
        self.source = OutputSource::Connect {
            port_match: Some(pattern.into()),
        };
        self
    }

    /// Play through `output` instead of resolving a hardware port
    pub fn with_output(mut self, output: TimedMidiOutput) -> Self {
        self.source = OutputSource::Injected(Mutex::new(Some(output)));
        self
    }

    /// True once dispatch has passed the schedule's end plus the settle
    /// window, or the stream was stopped
    pub fn is_output_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

impl MidiSync for MidiOutputSynchronizer {
    fn start(&self, context: &MidiSyncContext) {
        if !self.has_tracks() {
            return;
        }
        let output = match &self.source {
            OutputSource::Connect { port_match } => {
                match device::connect_output(port_match.as_deref()) {
                    Ok(output) => output,
                    Err(e) => {
                        // A missing synthesizer silences the sequences
                        // but must not take down the stream
                        log::warn!("MIDI: output unavailable, sequences will not sound: {}", e);
                        return;
                    }
                }
            }
            OutputSource::Injected(slot) => {
                let taken = match slot.lock() {
                    Ok(mut slot) => slot.take(),
                    Err(_) => None,
                };
                match taken {
                    Some(output) => output,
                    None => {
                        log::warn!("MIDI: injected output already consumed by an earlier stream");
                        return;
                    }
                }
            }
        };

        self.complete.store(false, Ordering::Release);
        self.audio_complete.store(false, Ordering::Release);

        let (control_tx, control_rx) = flume::unbounded();
        let mut engine = DispatchEngine::new(
            Arc::clone(&self.tracks),
            Arc::clone(&context.clock),
            Arc::clone(&context.schedule),
            output,
            self.synth_latency_ms,
            Arc::clone(&self.complete),
            Arc::clone(&self.audio_complete),
        );
        match thread::Builder::new()
            .name("capstan-midi".into())
            .spawn(move || engine.run(control_rx))
        {
            Ok(thread) => {
                if let Ok(mut dispatch) = self.dispatch.lock() {
                    *dispatch = Some(Dispatch {
                        control: control_tx,
                        thread,
                    });
                }
            }
            Err(e) => log::error!("MIDI: failed to spawn dispatch thread: {}", e),
        }
    }

    fn set_paused(&self, paused: bool) {
        if let Ok(dispatch) = self.dispatch.lock() {
            if let Some(dispatch) = dispatch.as_ref() {
                let _ = dispatch.control.send(Control::SetPaused(paused));
            }
        }
    }

    fn stop(&self) {
        let dispatch = match self.dispatch.lock() {
            Ok(mut dispatch) => dispatch.take(),
            Err(_) => None,
        };
        if let Some(dispatch) = dispatch {
            let _ = dispatch.control.send(Control::Stop);
            if dispatch.thread.join().is_err() {
                log::warn!("MIDI: dispatch thread panicked during shutdown");
            }
        }
        self.complete.store(true, Ordering::Release);
    }

    fn output_complete(&self) {
        self.audio_complete.store(true, Ordering::Release);
    }

    fn has_tracks(&self) -> bool {
        self.tracks.iter().any(|t| !t.sequence.is_empty())
    }
}

/// What the dispatcher will emit next
enum NextEvent {
    Event(MergedEvent),
    /// Pass-end sentinel; silences held notes and either restarts the
    /// iterator (looping) or ends dispatch
    AllOff { time: f64 },
    Done,
}

struct DispatchEngine {
    tracks: Arc<Vec<MidiTrack>>,
    clock: Arc<StreamClock>,
    schedule: Arc<PlaybackSchedule>,
    output: TimedMidiOutput,
    synth_latency_ms: f64,
    complete: Arc<AtomicBool>,
    audio_complete: Arc<AtomicBool>,
    iterator: Option<MergedIterator>,
    next: NextEvent,
    loop_passes: u32,
    /// True during the pre-start scan that replays channel state
    send_state: bool,
    paused: bool,
    midi_paused: bool,
    has_solo: bool,
    /// Notes currently sounding, for the silencing flush
    sounding: Vec<(u8, u8)>,
    max_timestamp: i64,
    scratch: Vec<u8>,
}

impl DispatchEngine {
    fn new(
        tracks: Arc<Vec<MidiTrack>>,
        clock: Arc<StreamClock>,
        schedule: Arc<PlaybackSchedule>,
        output: TimedMidiOutput,
        synth_latency_ms: f64,
        complete: Arc<AtomicBool>,
        audio_complete: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tracks,
            clock,
            schedule,
            output,
            synth_latency_ms,
            complete,
            audio_complete,
            iterator: None,
            next: NextEvent::Done,
            loop_passes: 0,
            send_state: false,
            paused: false,
            midi_paused: false,
            has_solo: false,
            sounding: Vec::new(),
            max_timestamp: 0,
            scratch: Vec::new(),
        }
    }

    fn run(&mut self, control: flume::Receiver<Control>) {
        self.prepare_iterator(true, 0.0);
        loop {
            match control.recv_timeout(MIDI_SLEEP) {
                Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Control::SetPaused(paused)) => self.paused = paused,
                Err(RecvTimeoutError::Timeout) => {
                    // No dispatch until the callback establishes the clock
                    if self.clock.num_frames() > 0 {
                        self.tick();
                    }
                }
            }
        }
        self.shutdown();
    }

    fn loop_offset(&self) -> f64 {
        f64::from(self.loop_passes) * (self.schedule.t1() - self.schedule.t0())
    }

    /// Build a fresh iterator at `offset` and scan it up to the start
    /// point. With `send`, channel state seen during the scan (program,
    /// controller, bend) is replayed immediately so mid-sequence starts
    /// sound right; notes are never replayed.
    fn prepare_iterator(&mut self, send: bool, offset: f64) {
        self.iterator = Some(MergedIterator::new(Arc::clone(&self.tracks), offset));
        self.get_next_event();
        self.send_state = true;
        let start = self.schedule.t0() + offset;
        loop {
            let time = match &self.next {
                NextEvent::Event(event) => event.time,
                _ => break,
            };
            if time >= start {
                break;
            }
            if send {
                self.output_event();
            }
            self.get_next_event();
        }
        self.send_state = false;
    }

    fn get_next_event(&mut self) {
        let horizon = self.schedule.t1() + self.loop_offset();
        let candidate = self.iterator.as_mut().and_then(|it| it.next_event());
        match candidate {
            Some(event) if event.time <= horizon => self.next = NextEvent::Event(event),
            _ => {
                // Past the selection end; one sentinel closes the pass
                self.next = NextEvent::AllOff {
                    time: horizon - HORIZON_EPSILON,
                };
                self.iterator = None;
            }
        }
    }

    /// Stream time for a merged event time, unwinding the loop offset
    /// through the warp when one is active
    fn uncorrected_time(&self, event_time: f64) -> f64 {
        let time = if self.schedule.has_warp() {
            self.schedule.real_duration(event_time - self.loop_offset())
                + self.schedule.t0()
                + f64::from(self.loop_passes) * self.schedule.warped_length()
        } else {
            event_time
        };
        time + self.clock.pause_time()
    }

    fn refresh_solo(&mut self) {
        self.has_solo = self.tracks.iter().any(|t| t.controls.solo());
    }

    fn tick(&mut self) {
        if self.paused {
            if !self.midi_paused {
                self.midi_paused = true;
                self.all_notes_off(false);
            }
            self.output.flush_due(self.clock.midi_time());
            return;
        }
        self.midi_paused = false;

        self.refresh_solo();

        // Everything due within the dispatch period plus scheduling slop
        // must be queued now. A MIDI path slower than the audio output
        // latency pulls the horizon forward by the difference.
        let mut horizon = self.clock.audio_time();
        let actual_latency = (MIDI_SLEEP.as_millis() as f64
            + THREAD_LATENCY_MS
            + MIDI_MINIMAL_LATENCY_MS as f64
            + self.synth_latency_ms)
            * 0.001;
        let audio_latency = self.clock.audio_out_latency();
        if actual_latency > audio_latency {
            horizon += actual_latency - audio_latency;
        }

        loop {
            let due = match &self.next {
                NextEvent::Done => break,
                NextEvent::Event(event) => self.uncorrected_time(event.time) < horizon,
                NextEvent::AllOff { time } => self.uncorrected_time(*time) < horizon,
            };
            if !due {
                break;
            }
            if self.output_event() {
                // The sentinel already advanced (or finished) the iterator
                continue;
            }
            self.get_next_event();
        }

        self.output.flush_due(self.clock.midi_time());
        self.check_complete();
    }

    /// Emit the current event to the timestamped queue. Returns true
    /// when the call itself advanced the iterator (pass sentinel).
    fn output_event(&mut self) -> bool {
        let event = match &self.next {
            NextEvent::Event(event) => *event,
            NextEvent::AllOff { .. } => {
                let looping = self.schedule.looping();
                self.all_notes_off(looping);
                if looping {
                    self.loop_passes += 1;
                    let offset = self.loop_offset();
                    self.prepare_iterator(false, offset);
                } else {
                    self.next = NextEvent::Done;
                }
                return true;
            }
            NextEvent::Done => return true,
        };

        let track = &self.tracks[event.track];
        let channel = event.event.channel & 0xF;

        let mut time = self.uncorrected_time(event.time);
        // Half a millisecond for timestamp rounding, one second for the
        // MIDI clock's bias, minus the synthesizer's own latency
        time += 0.0005 - self.synth_latency_ms * 0.001 + 1.0;
        // State replay goes out immediately; the MIDI clock restarts
        // with the stream, so nothing may stay scheduled from before
        if time < 0.0 || self.send_state {
            time = 0.0;
        }
        let timestamp = (time * 1000.0) as i64;

        let audible = track.channel_visible(channel)
            && !((self.has_solo || track.controls.mute()) && !track.controls.solo());
        let is_off = event.event.is_note() && !event.is_note_on;
        // Offs bypass the gate; a mute toggle mid-note must not leave
        // the note hanging
        if !(audible || is_off) {
            return false;
        }

        let message = match event.event.kind {
            MidiEventKind::Note { key, velocity } => {
                if self.send_state {
                    None
                } else if event.is_note_on {
                    let velocity =
                        (i16::from(velocity) + track.velocity_offset).clamp(1, 127) as u8;
                    if let Some(iterator) = self.iterator.as_mut() {
                        iterator.request_note_off();
                    }
                    self.sounding.push((channel, key));
                    Some(MidiMessage::NoteOn {
                        key: key.into(),
                        vel: velocity.into(),
                    })
                } else {
                    if let Some(index) = self
                        .sounding
                        .iter()
                        .position(|&(c, k)| c == channel && k == key)
                    {
                        self.sounding.remove(index);
                    }
                    Some(MidiMessage::NoteOn {
                        key: key.into(),
                        vel: 0.into(),
                    })
                }
            }
            MidiEventKind::ProgramChange { program } => Some(MidiMessage::ProgramChange {
                program: program.into(),
            }),
            MidiEventKind::Controller { controller, value } => {
                let value = ((value * 127.0).round() as i64).clamp(0, 127) as u8;
                Some(MidiMessage::Controller {
                    controller: controller.into(),
                    value: value.into(),
                })
            }
            MidiEventKind::PitchBend { amount } => {
                let raw = ((f64::from(0x2000u16) * (amount + 1.0)).round() as i64)
                    .clamp(0, 0x3fff) as u16;
                Some(MidiMessage::PitchBend {
                    bend: midly::PitchBend(raw.into()),
                })
            }
            MidiEventKind::ChannelPressure { amount } => {
                let vel = ((amount * 127.0) as i64).clamp(0, 127) as u8;
                Some(MidiMessage::ChannelAftertouch { vel: vel.into() })
            }
            MidiEventKind::KeyPressure { key, amount } => {
                let vel = ((amount * 127.0) as i64).clamp(0, 127) as u8;
                Some(MidiMessage::Aftertouch {
                    key: key.into(),
                    vel: vel.into(),
                })
            }
        };

        if let Some(message) = message {
            if timestamp > self.max_timestamp {
                self.max_timestamp = timestamp;
            }
            self.queue_message(channel, message, timestamp);
        }
        false
    }

    fn queue_message(&mut self, channel: u8, message: MidiMessage, timestamp: i64) {
        let event = LiveEvent::Midi {
            channel: channel.into(),
            message,
        };
        self.scratch.clear();
        if event.write(&mut self.scratch).is_err() {
            log::warn!("MIDI: event encoding failed");
            return;
        }
        self.output.send_at(timestamp, &self.scratch);
    }

    /// Send offs for every sounding note, then All Notes Off (CC 123)
    /// on all 16 channels.
    ///
    /// Outside a loop restart the messages step 1 ms apart on Linux;
    /// ALSA sequencers can drop same-stamped messages arriving at close.
    fn all_notes_off(&mut self, looping: bool) {
        let do_delay = cfg!(target_os = "linux") && !looping;
        let now = self.clock.midi_time();
        if self.max_timestamp < now {
            self.max_timestamp = now;
        }
        self.max_timestamp += 1;

        let sounding = mem::take(&mut self.sounding);
        for (channel, key) in sounding {
            let timestamp = if do_delay { self.max_timestamp } else { 0 };
            self.queue_message(
                channel,
                MidiMessage::NoteOn {
                    key: key.into(),
                    vel: 0.into(),
                },
                timestamp,
            );
            self.max_timestamp += 1;
        }
        for channel in 0u8..16 {
            let timestamp = if do_delay { self.max_timestamp } else { 0 };
            self.queue_message(
                channel,
                MidiMessage::Controller {
                    controller: 123.into(),
                    value: 0.into(),
                },
                timestamp,
            );
            self.max_timestamp += 1;
        }
    }

    fn check_complete(&mut self) {
        if self.complete.load(Ordering::Relaxed) {
            return;
        }
        // Straight play finishes once the dispatched timeline passes T1
        // plus the settle window; other modes end only when the host
        // stops the stream
        let real_time = self.clock.midi_time() as f64 * 0.001 - self.clock.pause_time() - 1.0;
        let settled = self.schedule.playing_straight()
            && real_time >= self.schedule.t1() + self.clock.tuning().settle_seconds;
        let drained = self.audio_complete.load(Ordering::Acquire)
            && matches!(self.next, NextEvent::Done)
            && self.output.is_empty();
        if settled || drained {
            self.complete.store(true, Ordering::Release);
        }
    }

    fn shutdown(&mut self) {
        self.all_notes_off(false);
        // Deliver on schedule before the port closes; ALSA discards
        // messages still queued at close
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.max_timestamp + 2 > self.clock.midi_time() {
            if Instant::now() >= deadline {
                log::warn!(
                    "MIDI: shutdown drain timed out with {} messages pending",
                    self.output.pending()
                );
                break;
            }
            self.output.flush_due(self.clock.midi_time());
            thread::sleep(Duration::from_millis(1));
        }
        self.output.flush_all();
        self.complete.store(true, Ordering::Release);
    }
}
