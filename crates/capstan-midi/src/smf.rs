//! Standard MIDI File loading
//!
//! Each SMF track becomes a [`NoteSequence`], with tick times resolved
//! to seconds through the file's tempo map and note on/off pairs folded
//! into single events carrying a duration.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use crate::sequence::{MidiEventKind, MidiPlayEvent, NoteSequence};
use crate::MidiError;

pub fn load_sequences(path: &Path) -> Result<Vec<NoteSequence>, MidiError> {
    let bytes = std::fs::read(path)?;
    parse_sequences(&bytes)
}

/// Parse SMF bytes into one sequence per track.
///
/// Tracks with no playable events (conductor tracks) are dropped.
pub fn parse_sequences(bytes: &[u8]) -> Result<Vec<NoteSequence>, MidiError> {
    let smf = Smf::parse(bytes).map_err(|e| MidiError::Parse(e.to_string()))?;
    let tempo = TempoMap::build(&smf);

    let mut sequences = Vec::new();
    for (index, track) in smf.tracks.iter().enumerate() {
        let mut sequence = NoteSequence::new(format!("track {}", index + 1));
        // Sounding notes awaiting their off, keyed by (channel, key).
        // A queue per key pairs overlapping same-pitch notes first-on
        // first-off.
        let mut open: BTreeMap<(u8, u8), VecDeque<(f64, u8)>> = BTreeMap::new();
        let mut tick: u64 = 0;

        for event in track {
            tick += u64::from(event.delta.as_int());
            let time = tempo.seconds_at(tick);
            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    if let Ok(name) = std::str::from_utf8(name) {
                        if !name.trim().is_empty() {
                            sequence.set_name(name.trim());
                        }
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let channel = channel.as_int();
                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            open.entry((channel, key.as_int()))
                                .or_default()
                                .push_back((time, vel.as_int()));
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            if let Some((start, velocity)) = open
                                .get_mut(&(channel, key.as_int()))
                                .and_then(|queue| queue.pop_front())
                            {
                                sequence.push(MidiPlayEvent {
                                    time: start,
                                    duration: (time - start).max(0.0),
                                    channel,
                                    kind: MidiEventKind::Note {
                                        key: key.as_int(),
                                        velocity,
                                    },
                                });
                            }
                        }
                        MidiMessage::Controller { controller, value } => {
                            sequence.push(MidiPlayEvent {
                                time,
                                duration: 0.0,
                                channel,
                                kind: MidiEventKind::Controller {
                                    controller: controller.as_int(),
                                    value: f64::from(value.as_int()) / 127.0,
                                },
                            });
                        }
                        MidiMessage::ProgramChange { program } => {
                            sequence.push(MidiPlayEvent {
                                time,
                                duration: 0.0,
                                channel,
                                kind: MidiEventKind::ProgramChange {
                                    program: program.as_int(),
                                },
                            });
                        }
                        MidiMessage::PitchBend { bend } => {
                            sequence.push(MidiPlayEvent {
                                time,
                                duration: 0.0,
                                channel,
                                kind: MidiEventKind::PitchBend {
                                    amount: (f64::from(bend.0.as_int()) - 8192.0) / 8192.0,
                                },
                            });
                        }
                        MidiMessage::ChannelAftertouch { vel } => {
                            sequence.push(MidiPlayEvent {
                                time,
                                duration: 0.0,
                                channel,
                                kind: MidiEventKind::ChannelPressure {
                                    amount: f64::from(vel.as_int()) / 127.0,
                                },
                            });
                        }
                        MidiMessage::Aftertouch { key, vel } => {
                            sequence.push(MidiPlayEvent {
                                time,
                                duration: 0.0,
                                channel,
                                kind: MidiEventKind::KeyPressure {
                                    key: key.as_int(),
                                    amount: f64::from(vel.as_int()) / 127.0,
                                },
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        // Notes never closed end with the track
        let end = tempo.seconds_at(tick);
        for ((channel, key), opens) in open {
            for (start, velocity) in opens {
                sequence.push(MidiPlayEvent {
                    time: start,
                    duration: (end - start).max(0.0),
                    channel,
                    kind: MidiEventKind::Note { key, velocity },
                });
            }
        }

        if !sequence.is_empty() {
            sequences.push(sequence);
        }
    }
    Ok(sequences)
}

#[derive(Debug, Clone, Copy)]
struct TempoPoint {
    tick: u64,
    seconds: f64,
    us_per_beat: f64,
}

/// Tick-to-seconds conversion for one file.
///
/// Metrical files gather tempo changes from every track (format 1
/// keeps them in the conductor track); timecode files run at a fixed
/// tick rate and ignore tempo events.
enum TempoMap {
    Metrical {
        ticks_per_beat: f64,
        points: Vec<TempoPoint>,
    },
    Timecode {
        seconds_per_tick: f64,
    },
}

impl TempoMap {
    fn build(smf: &Smf) -> Self {
        match smf.header.timing {
            Timing::Metrical(tpb) => {
                let ticks_per_beat = f64::from(tpb.as_int()).max(1.0);
                let mut changes: Vec<(u64, u32)> = Vec::new();
                for track in &smf.tracks {
                    let mut tick = 0u64;
                    for event in track {
                        tick += u64::from(event.delta.as_int());
                        if let TrackEventKind::Meta(MetaMessage::Tempo(us)) = event.kind {
                            changes.push((tick, us.as_int()));
                        }
                    }
                }
                changes.sort_by_key(|&(tick, _)| tick);

                let mut points = vec![TempoPoint {
                    tick: 0,
                    seconds: 0.0,
                    us_per_beat: 500_000.0,
                }];
                for (tick, us) in changes {
                    let last = points[points.len() - 1];
                    if tick == last.tick {
                        // Same-tick changes collapse; the last one wins
                        if let Some(point) = points.last_mut() {
                            point.us_per_beat = f64::from(us);
                        }
                    } else {
                        let seconds = last.seconds
                            + (tick - last.tick) as f64 * last.us_per_beat
                                / (1_000_000.0 * ticks_per_beat);
                        points.push(TempoPoint {
                            tick,
                            seconds,
                            us_per_beat: f64::from(us),
                        });
                    }
                }
                TempoMap::Metrical {
                    ticks_per_beat,
                    points,
                }
            }
            Timing::Timecode(fps, subframe) => TempoMap::Timecode {
                seconds_per_tick: 1.0 / (f64::from(fps.as_f32()) * f64::from(subframe.max(1))),
            },
        }
    }

    fn seconds_at(&self, tick: u64) -> f64 {
        match self {
            TempoMap::Timecode { seconds_per_tick } => tick as f64 * seconds_per_tick,
            TempoMap::Metrical {
                ticks_per_beat,
                points,
            } => {
                // points[0] sits at tick 0, so a governing point exists
                let index = points.partition_point(|p| p.tick <= tick);
                let point = points[index - 1];
                point.seconds
                    + (tick - point.tick) as f64 * point.us_per_beat
                        / (1_000_000.0 * ticks_per_beat)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u15, u24, u28, u4, u7};
    use midly::{Format, Fps, Header, PitchBend, TrackEvent};

    fn midi(delta: u32, channel: u8, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::from(delta),
            kind: TrackEventKind::Midi {
                channel: u4::from(channel),
                message,
            },
        }
    }

    fn meta(delta: u32, message: MetaMessage<'_>) -> TrackEvent<'_> {
        TrackEvent {
            delta: u28::from(delta),
            kind: TrackEventKind::Meta(message),
        }
    }

    fn note_on(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
        midi(
            delta,
            0,
            MidiMessage::NoteOn {
                key: u7::from(key),
                vel: u7::from(vel),
            },
        )
    }

    fn note_off(delta: u32, key: u8) -> TrackEvent<'static> {
        midi(
            delta,
            0,
            MidiMessage::NoteOff {
                key: u7::from(key),
                vel: u7::from(0),
            },
        )
    }

    fn to_bytes(smf: &Smf) -> Vec<u8> {
        let mut bytes = Vec::new();
        smf.write(&mut bytes).unwrap();
        bytes
    }

    fn metrical(ticks_per_beat: u16) -> Smf<'static> {
        Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::from(ticks_per_beat)),
        ))
    }

    #[test]
    fn test_note_pairing_at_default_tempo() {
        // 480 ticks per beat at the default 120 BPM: one beat is 0.5 s
        let mut smf = metrical(480);
        smf.tracks.push(vec![
            note_on(480, 60, 96),
            note_off(480, 60),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        assert_eq!(sequences.len(), 1);
        let events = sequences[0].events();
        assert_eq!(events.len(), 1);
        assert!((events[0].time - 0.5).abs() < 1e-9);
        assert!((events[0].duration - 0.5).abs() < 1e-9);
        assert_eq!(
            events[0].kind,
            MidiEventKind::Note {
                key: 60,
                velocity: 96
            }
        );
    }

    #[test]
    fn test_tempo_change_scales_later_events() {
        let mut smf = metrical(480);
        smf.tracks.push(vec![
            meta(0, MetaMessage::Tempo(u24::from(500_000))),
            meta(480, MetaMessage::Tempo(u24::from(250_000))),
            note_on(480, 60, 64),
            note_off(480, 60),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        let events = sequences[0].events();
        // 0.5 s for the first beat, 0.25 s for the second
        assert!((events[0].time - 0.75).abs() < 1e-9);
        assert!((events[0].duration - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_note_on_zero_velocity_ends_note() {
        let mut smf = metrical(480);
        smf.tracks.push(vec![
            note_on(0, 60, 100),
            note_on(480, 60, 0),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        let events = sequences[0].events();
        assert_eq!(events.len(), 1);
        assert!((events[0].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_update_normalization() {
        let mut smf = metrical(480);
        smf.tracks.push(vec![
            midi(
                0,
                3,
                MidiMessage::Controller {
                    controller: u7::from(64),
                    value: u7::from(127),
                },
            ),
            midi(
                0,
                3,
                MidiMessage::PitchBend {
                    bend: PitchBend(0.into()),
                },
            ),
            midi(
                0,
                3,
                MidiMessage::ProgramChange {
                    program: u7::from(12),
                },
            ),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        let events = sequences[0].events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.channel == 3));
        assert!(events.iter().any(
            |e| matches!(e.kind, MidiEventKind::Controller { controller: 64, value } if (value - 1.0).abs() < 1e-9)
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, MidiEventKind::PitchBend { amount } if (amount + 1.0).abs() < 1e-9)));
        assert!(events
            .iter()
            .any(|e| e.kind == MidiEventKind::ProgramChange { program: 12 }));
    }

    #[test]
    fn test_track_name_applied() {
        let mut smf = metrical(480);
        smf.tracks.push(vec![
            meta(0, MetaMessage::TrackName(b"Lead Synth")),
            note_on(0, 60, 64),
            note_off(480, 60),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        assert_eq!(sequences[0].name(), "Lead Synth");
    }

    #[test]
    fn test_unterminated_note_closed_at_track_end() {
        let mut smf = metrical(480);
        smf.tracks.push(vec![
            note_on(0, 72, 80),
            meta(960, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        let events = sequences[0].events();
        assert_eq!(events.len(), 1);
        assert!((events[0].duration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_conductor_track_dropped() {
        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::from(480)),
        ));
        smf.tracks.push(vec![
            meta(0, MetaMessage::Tempo(u24::from(250_000))),
            meta(0, MetaMessage::EndOfTrack),
        ]);
        smf.tracks.push(vec![
            note_on(480, 60, 64),
            note_off(480, 60),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        assert_eq!(sequences.len(), 1);
        // Conductor tempo applies to the note track
        assert!((sequences[0].events()[0].time - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_timecode_timing_fixed_rate() {
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Timecode(Fps::Fps25, 40),
        ));
        smf.tracks.push(vec![
            note_on(500, 60, 64),
            note_off(500, 60),
            meta(0, MetaMessage::EndOfTrack),
        ]);

        // 25 fps x 40 subframes = 1000 ticks per second
        let sequences = parse_sequences(&to_bytes(&smf)).unwrap();
        let events = sequences[0].events();
        assert!((events[0].time - 0.5).abs() < 1e-9);
        assert!((events[0].duration - 0.5).abs() < 1e-9);
    }
}
