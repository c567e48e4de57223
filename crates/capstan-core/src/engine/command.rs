//! Lock-free channels between control threads and the hardware callback
//!
//! Two queues, both `rtrb` single-producer single-consumer rings:
//!
//! - **commands** flow from the owning thread into the callback, which
//!   drains them at the top of each invocation so a change never lands
//!   mid-buffer;
//! - **dropout records** flow back out of the callback when captured
//!   audio had to be padded, so the lost stretches can be labeled after
//!   the stream stops.
//!
//! A mutex would let the control thread stall the callback for the length
//! of whatever else it holds the lock across; push and pop here are
//! wait-free and allocation-free, which is the budget the callback lives
//! under. Seeking is deliberately absent: a seek has to drain and refill
//! ring buffers, so it goes through the buffering thread's control
//! channel instead of this one.

/// Commands applied by the callback at frame boundaries
///
/// Track indices refer to the playback track order fixed at stream start.
/// Gain and pan land in the shared [`TrackControls`] atomics; routing the
/// writes through the callback keeps every change aligned to a buffer
/// edge, and the fade ramp in the mix hides the step.
///
/// [`TrackControls`]: crate::engine::track::TrackControls
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    /// Suspend or resume transport advancement; paused buffers emit
    /// silence (or playthrough) and count toward pause time
    SetPaused(bool),

    // ─────────────────────────────────────────────────────────────
    // Per-track controls
    // ─────────────────────────────────────────────────────────────
    /// Set linear gain for one playback track
    SetGain { track: usize, gain: f32 },
    /// Set stereo pan for one playback track (-1 left .. +1 right)
    SetPan { track: usize, pan: f32 },
    /// Mute or unmute one playback track
    SetMute { track: usize, muted: bool },
    /// Solo or unsolo one playback track
    SetSolo { track: usize, soloed: bool },
}

/// One stretch of capture that was padded with silence
///
/// Times are in seconds on the track timeline, latency-corrected, so the
/// record points at the zeros actually written to storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LostInterval {
    pub start: f64,
    pub duration: f64,
}

/// Capacity of the command queue
///
/// Commands arrive singly from user gestures, never in bursts; 64 is
/// far more than a callback period's worth.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Capacity of the dropout-record queue
///
/// One record per afflicted callback, and consecutive dropouts merge on
/// the reader side, so this only overflows if nobody is draining. An
/// overflowing push is dropped; the lost-sample count still advances.
pub const DROPOUT_QUEUE_CAPACITY: usize = 256;

/// Create the command channel (control side, callback side)
pub fn command_channel() -> (
    rtrb::Producer<TransportCommand>,
    rtrb::Consumer<TransportCommand>,
) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

/// Create the dropout-record channel (callback side, control side)
pub fn dropout_channel() -> (rtrb::Producer<LostInterval>, rtrb::Consumer<LostInterval>) {
    rtrb::RingBuffer::new(DROPOUT_QUEUE_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let (mut tx, mut rx) = command_channel();

        tx.push(TransportCommand::SetGain {
            track: 2,
            gain: 0.5,
        })
        .unwrap();
        tx.push(TransportCommand::SetPaused(true)).unwrap();

        assert_eq!(
            rx.pop().unwrap(),
            TransportCommand::SetGain {
                track: 2,
                gain: 0.5
            }
        );
        assert_eq!(rx.pop().unwrap(), TransportCommand::SetPaused(true));
        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_command_size() {
        // Commands are copied through a fixed ring; keep them within a
        // third of a cache line so a burst stays cheap to drain.
        let size = std::mem::size_of::<TransportCommand>();
        assert!(size <= 24, "TransportCommand is {} bytes", size);
    }

    #[test]
    fn test_dropout_records_preserve_order() {
        let (mut tx, mut rx) = dropout_channel();
        tx.push(LostInterval {
            start: 1.0,
            duration: 0.01,
        })
        .unwrap();
        tx.push(LostInterval {
            start: 1.01,
            duration: 0.02,
        })
        .unwrap();

        let first = rx.pop().unwrap();
        assert_eq!(first.start, 1.0);
        let second = rx.pop().unwrap();
        assert_eq!(second.duration, 0.02);
    }
}
