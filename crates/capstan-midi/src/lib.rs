//! MIDI sequence playback for the capstan transport
//!
//! This crate provides:
//! - Timed note sequences and a merged multi-track iterator
//! - Standard MIDI File loading via midly
//! - Output port discovery and connection via midir
//! - A dispatch engine implementing the transport's `MidiSync` seam
//!
//! # Architecture
//!
//! ```text
//! NoteSequence → MergedIterator → dispatch thread → TimedMidiOutput → midir
//!                                       ↑
//!                         StreamClock / PlaybackSchedule
//! ```
//!
//! The dispatch thread wakes every 10 ms, converts events due inside
//! its lookahead window to wire messages, and queues them with
//! millisecond timestamps; the queue delivers each message when the
//! stream's MIDI clock reaches it. Audio owns time throughout: MIDI
//! never adjusts the clock, it only follows.

mod device;
mod sequence;
mod smf;
mod synchronizer;

pub use device::{
    connect_output, list_output_ports, midi_device_report, MidiConnectionError, MidiPort,
    MidirPort, TimedMidiOutput,
};
pub use sequence::{
    MergedEvent, MergedIterator, MidiEventKind, MidiPlayEvent, MidiTrack, NoteSequence,
};
pub use smf::{load_sequences, parse_sequences};
pub use synchronizer::MidiOutputSynchronizer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MidiError {
    #[error("MIDI connection error: {0}")]
    Connection(#[from] MidiConnectionError),

    #[error("MIDI send failed: {0}")]
    Send(String),

    #[error("MIDI file unreadable: {0}")]
    File(#[from] std::io::Error),

    #[error("MIDI file malformed: {0}")]
    Parse(String),
}
