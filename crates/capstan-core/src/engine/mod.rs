//! The realtime engine
//!
//! Three thread roles cooperate around lock-free rings:
//!
//! - [`AudioTransport`](transport::AudioTransport) lives on the owning
//!   thread and runs stream lifecycle;
//! - the buffering thread ([`fill`]) mixes playback audio into the rings
//!   and drains captured audio out to storage;
//! - the hardware callbacks ([`callback`]) move samples between the
//!   rings and the device, advance the [`StreamClock`](clock::StreamClock),
//!   and never allocate, lock, or block.
//!
//! Everything shared across those roles is an [`Arc`](std::sync::Arc) of
//! atomics: the stream flags, the clock, the schedule positions, and the
//! rings themselves.

pub mod callback;
pub mod clock;
pub mod command;
pub mod fill;
pub mod mixer;
pub mod resample;
pub mod ring_buffer;
pub mod track;
pub mod transport;

pub use callback::Meters;
pub use clock::{ClockTuning, DriverTimeMode, StreamClock, MIDI_MINIMAL_LATENCY_MS};
pub use command::{LostInterval, TransportCommand};
pub use ring_buffer::RingBuffer;
pub use track::{
    CaptureError, CaptureSink, ChannelMap, MemoryCaptureSink, MemoryPlaybackSource,
    NullRealtimeEffects, PlaybackSource, PlaybackTrack, RealtimeEffects, TrackControls,
    WavCaptureSink,
};
pub use transport::{
    AudioTransport, CaptureTrack, MidiSync, MidiSyncContext, NullMidiSync, StreamFlags,
    TransportError, TransportListener, TransportTracks,
};
