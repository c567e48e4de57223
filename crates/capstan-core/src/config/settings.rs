//! Transport engine settings
//!
//! Everything the host can tune without recompiling: device selection,
//! dropout detection, latency and clock constants. Stored as YAML; every
//! field is individually optional so old config files keep loading as
//! fields are added.

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::engine::clock::{ClockTuning, DriverTimeMode};

/// Root settings structure for [`AudioTransport`](crate::engine::AudioTransport)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Device selection and hardware buffer size
    pub audio: AudioConfig,

    /// Project sample rate the host prefers to open streams at; the
    /// actual rate comes from rate negotiation against the devices.
    /// Default: none (use the engine default rate)
    pub preferred_rate: Option<f64>,

    /// Route live input to the output while capturing or monitoring
    /// Default: false
    pub playthrough: bool,

    /// Record the positions of capture overruns so lost stretches can be
    /// labelled afterwards
    /// Default: true
    pub detect_dropouts: bool,

    /// Also treat driver-reported input overflows as dropouts, on
    /// backends that report them
    /// Default: false
    pub detect_upstream_dropouts: bool,

    /// Estimated hardware round-trip offset applied to recordings, in
    /// milliseconds (normally negative: captured audio lands late)
    /// Default: -130.0
    pub latency_correction_ms: f64,

    /// Stream clock drift and settling constants
    pub clock: ClockTuning,

    /// Where the clock takes its output latency from
    /// Default: system clock correlation
    pub driver_time: DriverTimeMode,

    /// How far ahead of its timestamp a MIDI event is sent, compensating
    /// the synthesizer's own latency, in milliseconds
    /// Default: 5.0
    pub midi_synth_latency_ms: f64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            preferred_rate: None,
            playthrough: false,
            detect_dropouts: true,
            detect_upstream_dropouts: false,
            latency_correction_ms: -130.0,
            clock: ClockTuning::default(),
            driver_time: DriverTimeMode::default(),
            midi_synth_latency_ms: 5.0,
        }
    }
}

impl TransportSettings {
    /// Latency correction in seconds, the unit the schedules use
    pub fn latency_correction(&self) -> f64 {
        self.latency_correction_ms / 1000.0
    }

    /// Synth latency compensation in seconds
    pub fn midi_synth_latency(&self) -> f64 {
        self.midi_synth_latency_ms / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TransportSettings::default();
        assert!(settings.preferred_rate.is_none());
        assert!(!settings.playthrough);
        assert!(settings.detect_dropouts);
        assert!(!settings.detect_upstream_dropouts);
        assert_eq!(settings.latency_correction_ms, -130.0);
        assert_eq!(settings.midi_synth_latency_ms, 5.0);
        assert_eq!(settings.driver_time, DriverTimeMode::SystemClock);
    }

    #[test]
    fn test_unit_conversions() {
        let settings = TransportSettings::default();
        assert!((settings.latency_correction() - (-0.130)).abs() < 1e-12);
        assert!((settings.midi_synth_latency() - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let settings: TransportSettings =
            serde_yaml::from_str("playthrough: true\nlatency_correction_ms: -90.0\n").unwrap();
        assert!(settings.playthrough);
        assert_eq!(settings.latency_correction_ms, -90.0);
        // Unmentioned fields keep their defaults
        assert!(settings.detect_dropouts);
        assert!(settings.audio.playback_device.is_none());
    }
}
