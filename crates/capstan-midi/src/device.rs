//! MIDI output devices and the timestamped delivery queue
//!
//! [`TimedMidiOutput`] decouples event computation from delivery: the
//! dispatch thread queues wire messages with millisecond timestamps on
//! the stream's MIDI clock, and each flush sends whatever has come due.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Write as _;

use midir::{MidiOutput, MidiOutputConnection};

use crate::MidiError;

/// Error type for MIDI connection operations
#[derive(Debug, thiserror::Error)]
pub enum MidiConnectionError {
    #[error("Failed to initialize MIDI output: {0}")]
    OutputInitError(String),

    #[error("No MIDI output ports available")]
    NoOutputPorts,

    #[error("No MIDI port found matching pattern: {0}")]
    PortNotFound(String),

    #[error("Failed to connect to MIDI port: {0}")]
    ConnectionError(String),

    #[error("Failed to get port info: {0}")]
    PortInfoError(String),
}

/// Something that accepts a raw channel message right now.
///
/// The hardware seam under [`TimedMidiOutput`]; tests substitute a
/// recorder.
pub trait MidiPort: Send {
    fn send(&mut self, message: &[u8]) -> Result<(), MidiError>;
}

/// midir-backed hardware port
pub struct MidirPort {
    connection: MidiOutputConnection,
}

impl MidiPort for MidirPort {
    fn send(&mut self, message: &[u8]) -> Result<(), MidiError> {
        self.connection
            .send(message)
            .map_err(|e| MidiError::Send(e.to_string()))
    }
}

/// List the names of every available MIDI output port
pub fn list_output_ports() -> Result<Vec<String>, MidiConnectionError> {
    let output = MidiOutput::new("capstan-midi")
        .map_err(|e| MidiConnectionError::OutputInitError(e.to_string()))?;
    Ok(output
        .ports()
        .iter()
        .filter_map(|port| output.port_name(port).ok())
        .collect())
}

/// Open an output connection.
///
/// `port_match` is a case-insensitive substring over port names; `None`
/// takes the first available port.
pub fn connect_output(port_match: Option<&str>) -> Result<TimedMidiOutput, MidiConnectionError> {
    let output = MidiOutput::new("capstan-midi")
        .map_err(|e| MidiConnectionError::OutputInitError(e.to_string()))?;
    let ports = output.ports();
    if ports.is_empty() {
        return Err(MidiConnectionError::NoOutputPorts);
    }

    let port = match port_match {
        Some(pattern) => {
            let lowered = pattern.to_lowercase();
            ports
                .iter()
                .find(|port| {
                    output
                        .port_name(port)
                        .map(|name| name.to_lowercase().contains(&lowered))
                        .unwrap_or(false)
                })
                .ok_or_else(|| MidiConnectionError::PortNotFound(pattern.to_string()))?
        }
        None => &ports[0],
    };

    let name = output
        .port_name(port)
        .map_err(|e| MidiConnectionError::PortInfoError(e.to_string()))?;
    let connection = output
        .connect(port, "capstan-midi-out")
        .map_err(|e| MidiConnectionError::ConnectionError(e.to_string()))?;
    log::info!("MIDI: Connected output port: {}", name);
    Ok(TimedMidiOutput::new(Box::new(MidirPort { connection })))
}

/// Human-readable list of MIDI output ports, for startup logs
pub fn midi_device_report() -> String {
    let mut report = String::new();
    let _ = writeln!(report, "MIDI output ports:");
    match list_output_ports() {
        Ok(ports) if ports.is_empty() => {
            let _ = writeln!(report, "  (none)");
        }
        Ok(ports) => {
            for (index, name) in ports.iter().enumerate() {
                let _ = writeln!(report, "  [{}] {}", index, name);
            }
        }
        Err(e) => {
            let _ = writeln!(report, "  unavailable: {}", e);
        }
    }
    report
}

#[derive(Debug, Clone, Copy)]
struct QueuedMessage {
    timestamp: i64,
    order: u64,
    len: u8,
    bytes: [u8; 3],
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.order.cmp(&other.order))
    }
}

/// Output queue holding channel messages until their timestamp comes
/// due.
///
/// Timestamps are milliseconds on the stream's MIDI clock; 0 means
/// immediate. Among equal timestamps delivery keeps submission order,
/// so an off queued before a retriggered on stays ahead of it.
pub struct TimedMidiOutput {
    port: Box<dyn MidiPort>,
    queue: BinaryHeap<Reverse<QueuedMessage>>,
    next_order: u64,
}

impl TimedMidiOutput {
    pub fn new(port: Box<dyn MidiPort>) -> Self {
        Self {
            port,
            queue: BinaryHeap::new(),
            next_order: 0,
        }
    }

    /// Queue a channel voice message (1 to 3 bytes) for delivery at
    /// `timestamp`
    pub fn send_at(&mut self, timestamp: i64, message: &[u8]) {
        if message.is_empty() || message.len() > 3 {
            log::warn!(
                "MIDI: dropping {}-byte message; only channel voice messages are queued",
                message.len()
            );
            return;
        }
        let mut bytes = [0u8; 3];
        bytes[..message.len()].copy_from_slice(message);
        self.queue.push(Reverse(QueuedMessage {
            timestamp,
            order: self.next_order,
            len: message.len() as u8,
            bytes,
        }));
        self.next_order += 1;
    }

    /// Deliver every message due at or before `now`; returns how many
    /// went out
    pub fn flush_due(&mut self, now: i64) -> usize {
        let mut sent = 0;
        while let Some(&Reverse(message)) = self.queue.peek() {
            if message.timestamp > now {
                break;
            }
            self.queue.pop();
            self.deliver(&message);
            sent += 1;
        }
        sent
    }

    /// Deliver everything still queued regardless of timestamps
    pub fn flush_all(&mut self) -> usize {
        let mut sent = 0;
        while let Some(Reverse(message)) = self.queue.pop() {
            self.deliver(&message);
            sent += 1;
        }
        sent
    }

    fn deliver(&mut self, message: &QueuedMessage) {
        if let Err(e) = self.port.send(&message.bytes[..message.len as usize]) {
            log::warn!("MIDI: send failed: {}", e);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecorderPort {
        log: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MidiPort for RecorderPort {
        fn send(&mut self, message: &[u8]) -> Result<(), MidiError> {
            self.log.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    fn recorder() -> (TimedMidiOutput, Arc<Mutex<Vec<Vec<u8>>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let output = TimedMidiOutput::new(Box::new(RecorderPort {
            log: Arc::clone(&log),
        }));
        (output, log)
    }

    #[test]
    fn test_flush_due_respects_timestamps() {
        let (mut output, log) = recorder();
        output.send_at(30, &[0x90, 60, 64]);
        output.send_at(10, &[0x90, 61, 64]);
        output.send_at(20, &[0x90, 62, 64]);

        assert_eq!(output.flush_due(25), 2);
        let sent = log.lock().unwrap();
        assert_eq!(*sent, vec![vec![0x90, 61, 64], vec![0x90, 62, 64]]);
        drop(sent);
        assert_eq!(output.pending(), 1);
    }

    #[test]
    fn test_equal_timestamps_keep_submission_order() {
        let (mut output, log) = recorder();
        output.send_at(5, &[0x90, 60, 0]);
        output.send_at(5, &[0x90, 60, 64]);
        output.send_at(5, &[0x90, 61, 64]);

        output.flush_due(5);
        let sent = log.lock().unwrap();
        assert_eq!(
            *sent,
            vec![vec![0x90, 60, 0], vec![0x90, 60, 64], vec![0x90, 61, 64]]
        );
    }

    #[test]
    fn test_timestamp_zero_is_immediate() {
        let (mut output, log) = recorder();
        output.send_at(0, &[0xC0, 5]);
        assert_eq!(output.flush_due(0), 1);
        assert_eq!(*log.lock().unwrap(), vec![vec![0xC0, 5]]);
    }

    #[test]
    fn test_flush_all_ignores_timestamps() {
        let (mut output, log) = recorder();
        output.send_at(1_000_000, &[0x90, 60, 64]);
        output.send_at(2, &[0x90, 61, 64]);
        assert_eq!(output.flush_all(), 2);
        assert!(output.is_empty());
        // Still ordered by timestamp
        assert_eq!(
            *log.lock().unwrap(),
            vec![vec![0x90, 61, 64], vec![0x90, 60, 64]]
        );
    }

    #[test]
    fn test_oversize_message_dropped() {
        let (mut output, _log) = recorder();
        output.send_at(0, &[0xF0, 1, 2, 3, 0xF7]);
        assert!(output.is_empty());
    }
}
