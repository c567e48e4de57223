//! Audio device enumeration, rate probing, and diagnostics
//!
//! Devices are enumerated from ALL available hosts (JACK, ALSA,
//! PulseAudio, ...) so users can pick hardware from whichever backend
//! exposes it. On Linux with JACK running, JACK shows one "device" (the
//! server) while ALSA shows the individual cards.

use std::fmt::Write as _;

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};

use super::config::DeviceId;
use super::error::{AudioError, AudioResult};

/// Rates probed against device capability ranges, ascending
pub const RATES_TO_TRY: [f64; 17] = [
    8000.0, 9600.0, 11025.0, 12000.0, 15000.0, 16000.0, 22050.0, 24000.0, 32000.0, 44100.0,
    48000.0, 88200.0, 96000.0, 176400.0, 192000.0, 352800.0, 384000.0,
];

/// Stream direction, used to share one enumeration path between
/// playback and capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

impl Direction {
    pub fn noun(&self) -> &'static str {
        match self {
            Direction::Playback => "playback",
            Direction::Capture => "capture",
        }
    }
}

/// Human-readable name for a host ID
fn host_name(host_id: HostId) -> String {
    let name = format!("{host_id:?}");
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

fn host_by_name(name: &str) -> Option<Host> {
    for host_id in cpal::available_hosts() {
        if host_name(host_id) == name {
            return cpal::host_from_id(host_id).ok();
        }
    }
    None
}

fn devices_on(host: &Host, direction: Direction) -> AudioResult<Vec<cpal::Device>> {
    let devices: Box<dyn Iterator<Item = cpal::Device>> = match direction {
        Direction::Playback => Box::new(
            host.output_devices()
                .map_err(|e| AudioError::ConfigError(e.to_string()))?,
        ),
        Direction::Capture => Box::new(
            host.input_devices()
                .map_err(|e| AudioError::ConfigError(e.to_string()))?,
        ),
    };
    Ok(devices.collect())
}

pub(super) fn config_ranges(
    device: &cpal::Device,
    direction: Direction,
) -> AudioResult<Vec<cpal::SupportedStreamConfigRange>> {
    match direction {
        Direction::Playback => device
            .supported_output_configs()
            .map(|c| c.collect())
            .map_err(|e| AudioError::ConfigError(e.to_string())),
        Direction::Capture => device
            .supported_input_configs()
            .map(|c| c.collect())
            .map_err(|e| AudioError::ConfigError(e.to_string())),
    }
}

/// Information about one audio device in one direction
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub id: DeviceId,
    pub name: String,
    pub host: String,
    pub is_default: bool,
    /// Rates from [`RATES_TO_TRY`] the device accepts
    pub sample_rates: Vec<f64>,
    pub max_channels: u16,
}

/// Enumerate devices in one direction across all hosts
pub fn list_devices(direction: Direction) -> AudioResult<Vec<AudioDevice>> {
    let mut all_devices: Vec<AudioDevice> = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(err) => {
                log::debug!("could not initialize host {host_id:?}: {err}");
                continue;
            }
        };
        let host_label = host_name(host_id);

        let default_name = match direction {
            Direction::Playback => host.default_output_device(),
            Direction::Capture => host.default_input_device(),
        }
        .and_then(|d| d.name().ok());

        let devices = match devices_on(&host, direction) {
            Ok(devices) => devices,
            Err(err) => {
                log::debug!("could not enumerate {host_label} devices: {err}");
                continue;
            }
        };

        for device in devices {
            let Ok(name) = device.name() else { continue };
            let Ok(ranges) = config_ranges(&device, direction) else {
                continue;
            };
            if ranges.is_empty() {
                continue;
            }

            let mut sample_rates = Vec::new();
            let mut max_channels: u16 = 0;
            for range in &ranges {
                max_channels = max_channels.max(range.channels());
                for rate in RATES_TO_TRY {
                    if rate >= range.min_sample_rate().0 as f64
                        && rate <= range.max_sample_rate().0 as f64
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
            sample_rates.sort_by(f64::total_cmp);

            all_devices.push(AudioDevice {
                id: DeviceId::with_host(&name, &host_label),
                is_default: default_name.as_ref() == Some(&name),
                name,
                host: host_label.clone(),
                sample_rates,
                max_channels,
            });
        }
    }

    if all_devices.is_empty() {
        return Err(AudioError::NoDevices);
    }

    // Defaults first, then by host and name
    all_devices.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(all_devices)
}

/// Resolve a configured device id to a cpal device, searching the named
/// host first and every host as a fallback
pub fn find_device(id: &DeviceId, direction: Direction) -> AudioResult<cpal::Device> {
    if let Some(host_label) = &id.host {
        if let Some(host) = host_by_name(host_label) {
            return devices_on(&host, direction)?
                .into_iter()
                .find(|d| d.name().ok().as_ref() == Some(&id.name))
                .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()));
        }
    }

    for host_id in cpal::available_hosts() {
        if let Ok(host) = cpal::host_from_id(host_id) {
            if let Ok(devices) = devices_on(&host, direction) {
                if let Some(device) = devices
                    .into_iter()
                    .find(|d| d.name().ok().as_ref() == Some(&id.name))
                {
                    return Ok(device);
                }
            }
        }
    }
    Err(AudioError::DeviceNotFound(id.display_label()))
}

/// Default-host default device for a direction
pub fn default_device(direction: Direction) -> AudioResult<cpal::Device> {
    let host = cpal::default_host();
    match direction {
        Direction::Playback => host.default_output_device(),
        Direction::Capture => host.default_input_device(),
    }
    .ok_or_else(|| AudioError::NoDefaultDevice(format!("no default {} device", direction.noun())))
}

/// Resolve the configured-or-default device for a direction
pub fn resolve_device(id: Option<&DeviceId>, direction: Direction) -> AudioResult<cpal::Device> {
    match id {
        Some(id) => find_device(id, direction),
        None => default_device(direction),
    }
}

/// Rates the device accepts in one direction: the standard table plus the
/// desired rate itself when it falls inside a supported range. Ascending,
/// empty when the device cannot be queried.
pub fn supported_rates(
    device: &cpal::Device,
    direction: Direction,
    desired: Option<f64>,
) -> Vec<f64> {
    let Ok(ranges) = config_ranges(device, direction) else {
        return Vec::new();
    };
    let in_range = |rate: f64| {
        ranges.iter().any(|range| {
            rate >= range.min_sample_rate().0 as f64 && rate <= range.max_sample_rate().0 as f64
        })
    };

    let mut rates: Vec<f64> = RATES_TO_TRY.iter().copied().filter(|&r| in_range(r)).collect();
    if let Some(desired) = desired {
        if desired > 0.0 && !rates.contains(&desired) && in_range(desired) {
            rates.push(desired);
        }
    }
    rates.sort_by(f64::total_cmp);
    rates
}

/// Rates acceptable to both devices at once (for full-duplex streams)
pub fn supported_common_rates(
    playback: &cpal::Device,
    capture: &cpal::Device,
    desired: Option<f64>,
) -> Vec<f64> {
    let capture_rates = supported_rates(capture, Direction::Capture, desired);
    supported_rates(playback, Direction::Playback, desired)
        .into_iter()
        .filter(|rate| capture_rates.contains(rate))
        .collect()
}

/// Pick the rate to run a stream at, given an ascending candidate list:
/// the desired rate when supported, else the next higher supported rate,
/// else the highest there is. None when the list is empty.
pub fn best_rate(rates: &[f64], desired: f64) -> Option<f64> {
    if rates.contains(&desired) {
        return Some(desired);
    }
    rates
        .iter()
        .copied()
        .find(|&rate| rate > desired)
        .or_else(|| rates.last().copied())
}

/// Multi-line diagnostic listing of every host and device with its
/// capabilities, for bug reports
pub fn device_report() -> String {
    let mut report = String::new();
    let _ = writeln!(report, "==== audio device report ====");

    let hosts = cpal::available_hosts();
    let _ = writeln!(report, "available hosts: {}", hosts.len());
    for host_id in hosts {
        let _ = writeln!(report, "host: {}", host_name(host_id));
        let Ok(host) = cpal::host_from_id(host_id) else {
            let _ = writeln!(report, "  (could not initialize)");
            continue;
        };

        for direction in [Direction::Playback, Direction::Capture] {
            let default_name = match direction {
                Direction::Playback => host.default_output_device(),
                Direction::Capture => host.default_input_device(),
            }
            .and_then(|d| d.name().ok());

            let devices = match devices_on(&host, direction) {
                Ok(devices) => devices,
                Err(err) => {
                    let _ = writeln!(report, "  {} devices: error: {err}", direction.noun());
                    continue;
                }
            };
            let _ = writeln!(report, "  {} devices: {}", direction.noun(), devices.len());

            for device in devices {
                let name = device.name().unwrap_or_else(|_| "(unnamed)".to_string());
                let default_marker = if default_name.as_ref() == Some(&name) {
                    " (default)"
                } else {
                    ""
                };
                let _ = writeln!(report, "    {name}{default_marker}");

                match config_ranges(&device, direction) {
                    Ok(ranges) => {
                        let channels = ranges.iter().map(|r| r.channels()).max().unwrap_or(0);
                        let _ = writeln!(report, "      max channels: {channels}");
                        let rates = supported_rates(&device, direction, None);
                        let rates: Vec<String> =
                            rates.iter().map(|r| format!("{r:.0}")).collect();
                        let _ = writeln!(report, "      rates: {}", rates.join(" "));
                    }
                    Err(err) => {
                        let _ = writeln!(report, "      (no configurations: {err})");
                    }
                }
            }
        }
    }

    let _ = writeln!(report, "=============================");
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_rate_prefers_desired_then_next_higher() {
        let rates = [22050.0, 44100.0, 48000.0, 96000.0];
        assert_eq!(best_rate(&rates, 44100.0), Some(44100.0));
        // Unsupported rate steps up to the next one
        assert_eq!(best_rate(&rates, 44200.0), Some(48000.0));
        // Nothing higher: the best there is
        assert_eq!(best_rate(&rates, 192000.0), Some(96000.0));
        assert_eq!(best_rate(&[], 44100.0), None);
    }

    #[test]
    fn test_rate_table_is_ascending() {
        for pair in RATES_TO_TRY.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_device_report_never_panics() {
        // May legitimately find zero devices on CI; the report must still
        // render
        let report = device_report();
        assert!(report.contains("audio device report"));
    }
}
