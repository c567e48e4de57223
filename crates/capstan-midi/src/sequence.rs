//! Timed MIDI sequences and the merged playback iterator
//!
//! A [`NoteSequence`] holds events in seconds of sequence-local time;
//! notes carry their sounding duration instead of paired off events.
//! [`MergedIterator`] walks any number of placed sequences in stream
//! time order and synthesizes note-offs on request, so the dispatcher
//! only ever schedules an off for a note it actually started.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use capstan_core::engine::TrackControls;

/// Payload of one sequence event. Continuous controls are normalized
/// so they survive a round trip through the 7- and 14-bit wire scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MidiEventKind {
    Note { key: u8, velocity: u8 },
    ProgramChange { program: u8 },
    /// `value` in 0..=1
    Controller { controller: u8, value: f64 },
    /// `amount` in -1..=1, 0 centered
    PitchBend { amount: f64 },
    /// `amount` in 0..=1
    ChannelPressure { amount: f64 },
    /// `amount` in 0..=1
    KeyPressure { key: u8, amount: f64 },
}

/// One scheduled event within a sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiPlayEvent {
    /// Onset in seconds of sequence-local time
    pub time: f64,
    /// Sounding length for notes; 0 for channel updates
    pub duration: f64,
    /// Wire channel 0..=15
    pub channel: u8,
    pub kind: MidiEventKind,
}

impl MidiPlayEvent {
    pub fn is_note(&self) -> bool {
        matches!(self.kind, MidiEventKind::Note { .. })
    }

    pub fn end_time(&self) -> f64 {
        self.time + self.duration
    }
}

/// A named, time-ordered collection of events
#[derive(Debug, Clone, Default)]
pub struct NoteSequence {
    name: String,
    events: Vec<MidiPlayEvent>,
}

impl NoteSequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Insert keeping time order; equal times keep insertion order
    pub fn push(&mut self, event: MidiPlayEvent) {
        let index = self.events.partition_point(|e| e.time <= event.time);
        self.events.insert(index, event);
    }

    pub fn add_note(&mut self, time: f64, duration: f64, channel: u8, key: u8, velocity: u8) {
        self.push(MidiPlayEvent {
            time,
            duration,
            channel,
            kind: MidiEventKind::Note { key, velocity },
        });
    }

    pub fn events(&self) -> &[MidiPlayEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// End of the latest-sounding event. Events are ordered by onset,
    /// so an early long note can still end last.
    pub fn end_time(&self) -> f64 {
        self.events
            .iter()
            .map(|e| e.end_time())
            .fold(0.0, f64::max)
    }
}

/// A sequence placed on the stream timeline with its mixer state
#[derive(Debug, Clone)]
pub struct MidiTrack {
    pub sequence: NoteSequence,
    /// Shift applied to every event when placing the sequence on the
    /// timeline
    pub offset: f64,
    pub controls: Arc<TrackControls>,
    /// Added to note-on velocities before the 1..=127 clamp
    pub velocity_offset: i16,
    /// Bitmask of audible wire channels
    pub visible_channels: u16,
}

impl MidiTrack {
    pub fn new(sequence: NoteSequence) -> Self {
        Self {
            sequence,
            offset: 0.0,
            controls: TrackControls::new(),
            velocity_offset: 0,
            visible_channels: u16::MAX,
        }
    }

    pub fn channel_visible(&self, channel: u8) -> bool {
        self.visible_channels & (1 << (channel & 0xF)) != 0
    }

    pub fn end_time(&self) -> f64 {
        self.offset + self.sequence.end_time()
    }
}

/// An event drawn from the merge, stamped with its source track index
/// and final stream time
#[derive(Debug, Clone, Copy)]
pub struct MergedEvent {
    pub track: usize,
    /// Stream time with track and loop offsets applied
    pub time: f64,
    /// False for a synthesized note-off
    pub is_note_on: bool,
    pub event: MidiPlayEvent,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledOff {
    time: f64,
    order: u64,
    track: usize,
    event: MidiPlayEvent,
}

impl PartialEq for ScheduledOff {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for ScheduledOff {}

impl PartialOrd for ScheduledOff {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledOff {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.order.cmp(&other.order))
    }
}

/// Merged, time-ordered view over every track's events.
///
/// Note-offs exist only after [`request_note_off`] schedules one for
/// the note-on most recently drawn. A scheduled off sorts ahead of a
/// same-time onset, so a retriggered pitch is not silenced by its
/// previous instance's off.
///
/// [`request_note_off`]: MergedIterator::request_note_off
pub struct MergedIterator {
    tracks: Arc<Vec<MidiTrack>>,
    /// Added on top of each track's own offset; loop passes advance it
    offset: f64,
    cursors: Vec<usize>,
    scheduled_offs: BinaryHeap<Reverse<ScheduledOff>>,
    next_order: u64,
    last_on: Option<(usize, MidiPlayEvent)>,
}

impl MergedIterator {
    pub fn new(tracks: Arc<Vec<MidiTrack>>, offset: f64) -> Self {
        let cursors = vec![0; tracks.len()];
        Self {
            tracks,
            offset,
            cursors,
            scheduled_offs: BinaryHeap::new(),
            next_order: 0,
            last_on: None,
        }
    }

    fn head_time(&self, track: usize) -> Option<f64> {
        let event = self.tracks[track].sequence.events().get(self.cursors[track])?;
        Some(event.time + self.tracks[track].offset + self.offset)
    }

    pub fn next_event(&mut self) -> Option<MergedEvent> {
        let mut best: Option<(f64, usize)> = None;
        for track in 0..self.tracks.len() {
            if let Some(time) = self.head_time(track) {
                if best.map_or(true, |(t, _)| time < t) {
                    best = Some((time, track));
                }
            }
        }

        if let Some(&Reverse(off)) = self.scheduled_offs.peek() {
            if best.map_or(true, |(time, _)| off.time <= time) {
                self.scheduled_offs.pop();
                return Some(MergedEvent {
                    track: off.track,
                    time: off.time,
                    is_note_on: false,
                    event: off.event,
                });
            }
        }

        let (time, track) = best?;
        let event = self.tracks[track].sequence.events()[self.cursors[track]];
        self.cursors[track] += 1;
        if event.is_note() {
            self.last_on = Some((track, event));
        }
        Some(MergedEvent {
            track,
            time,
            is_note_on: true,
            event,
        })
    }

    /// Schedule the off for the most recent note-on the merge produced
    pub fn request_note_off(&mut self) {
        if let Some((track, event)) = self.last_on.take() {
            let time = event.end_time() + self.tracks[track].offset + self.offset;
            self.scheduled_offs.push(Reverse(ScheduledOff {
                time,
                order: self.next_order,
                track,
                event,
            }));
            self.next_order += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(time: f64, duration: f64, key: u8) -> MidiPlayEvent {
        MidiPlayEvent {
            time,
            duration,
            channel: 0,
            kind: MidiEventKind::Note { key, velocity: 64 },
        }
    }

    #[test]
    fn test_push_keeps_time_order() {
        let mut seq = NoteSequence::new("scratch");
        seq.push(note(2.0, 0.5, 62));
        seq.push(note(0.5, 0.5, 60));
        seq.push(note(1.0, 0.5, 61));
        let times: Vec<f64> = seq.events().iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0.5, 1.0, 2.0]);
    }

    #[test]
    fn test_end_time_sees_long_early_note() {
        let mut seq = NoteSequence::new("scratch");
        seq.push(note(0.0, 10.0, 60));
        seq.push(note(1.0, 0.5, 61));
        assert!((seq.end_time() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_orders_across_tracks() {
        let mut a = NoteSequence::new("a");
        a.push(note(0.0, 0.1, 60));
        a.push(note(2.0, 0.1, 61));
        let mut b = NoteSequence::new("b");
        b.push(note(1.0, 0.1, 70));
        b.push(note(3.0, 0.1, 71));

        let tracks = Arc::new(vec![MidiTrack::new(a), MidiTrack::new(b)]);
        let mut merge = MergedIterator::new(tracks, 0.0);
        let mut order = Vec::new();
        while let Some(event) = merge.next_event() {
            order.push((event.track, event.time));
        }
        assert_eq!(order, vec![(0, 0.0), (1, 1.0), (0, 2.0), (1, 3.0)]);
    }

    #[test]
    fn test_track_and_loop_offsets_apply() {
        let mut seq = NoteSequence::new("a");
        seq.push(note(1.0, 0.5, 60));
        let mut track = MidiTrack::new(seq);
        track.offset = 2.0;

        let tracks = Arc::new(vec![track]);
        let mut merge = MergedIterator::new(tracks, 10.0);
        let event = merge.next_event().unwrap();
        assert!((event.time - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_request_note_off_schedules_end() {
        let mut seq = NoteSequence::new("a");
        seq.push(note(1.0, 0.5, 60));
        let tracks = Arc::new(vec![MidiTrack::new(seq)]);
        let mut merge = MergedIterator::new(tracks, 0.0);

        let on = merge.next_event().unwrap();
        assert!(on.is_note_on);
        merge.request_note_off();

        let off = merge.next_event().unwrap();
        assert!(!off.is_note_on);
        assert!((off.time - 1.5).abs() < 1e-9);
        assert_eq!(off.track, 0);
        assert!(merge.next_event().is_none());
    }

    #[test]
    fn test_off_wins_tie_against_retrigger() {
        // Same pitch ends at 1.0 and restarts at 1.0; the off must come
        // out first or the new note gets cut
        let mut seq = NoteSequence::new("a");
        seq.push(note(0.0, 1.0, 60));
        seq.push(note(1.0, 1.0, 60));
        let tracks = Arc::new(vec![MidiTrack::new(seq)]);
        let mut merge = MergedIterator::new(tracks, 0.0);

        assert!(merge.next_event().unwrap().is_note_on);
        merge.request_note_off();
        let second = merge.next_event().unwrap();
        assert!(!second.is_note_on, "off at 1.0 should precede on at 1.0");
        let third = merge.next_event().unwrap();
        assert!(third.is_note_on);
        assert!((third.time - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_off_without_request() {
        let mut seq = NoteSequence::new("a");
        seq.push(note(0.0, 1.0, 60));
        let tracks = Arc::new(vec![MidiTrack::new(seq)]);
        let mut merge = MergedIterator::new(tracks, 0.0);
        assert!(merge.next_event().is_some());
        assert!(merge.next_event().is_none());
    }

    #[test]
    fn test_channel_visibility_mask() {
        let track = MidiTrack {
            visible_channels: 0b0000_0000_0000_0101,
            ..MidiTrack::new(NoteSequence::new("a"))
        };
        assert!(track.channel_visible(0));
        assert!(!track.channel_visible(1));
        assert!(track.channel_visible(2));
        assert!(!track.channel_visible(15));
    }
}
