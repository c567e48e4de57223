//! Time scheduling for playback, capture, and scrubbing
//!
//! The schedule types answer one question for the rest of the engine: at
//! this moment, which part of which track should be sounding (or being
//! written)? They have no I/O of their own. The engine threads consult
//! them:
//!
//! - [`PlaybackSchedule`] maps elapsed real time to track time across
//!   straight play, looping, and time warps
//! - [`RecordingSchedule`] accounts for capture latency, pre-roll, and
//!   punch-in crossfades
//! - [`ScrubQueue`] carries gesture-driven play intervals between the UI,
//!   the buffering thread, and the hardware callback
//! - [`TimeWarp`] is the pluggable speed-over-time curve

pub mod playback;
pub mod recording;
pub mod scrub;
pub mod warp;

pub use playback::{PlayMode, PlaybackSchedule, StartStreamOptions};
pub use recording::RecordingSchedule;
pub use scrub::{ScrubQueue, ScrubSession, ScrubSlice, ScrubbingOptions};
pub use warp::{StepWarp, TimeWarp};
