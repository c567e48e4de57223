//! Audio device selection and buffer configuration

use serde::{Deserialize, Serialize};

/// Maximum device buffer to pre-allocate callback scratch for.
/// Common negotiated sizes: 64, 128, 256, 512, 1024, 2048, 4096 frames.
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Requested buffer size when no preference is specified (frames).
/// Large enough to ride out scheduling jitter on most systems.
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Preferred device buffer size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferSize {
    /// Let the driver choose
    #[default]
    Default,
    /// Request a specific frame count (the driver may adjust it)
    Fixed(u32),
}

impl BufferSize {
    /// Frame count to request, or None for the driver default
    pub fn as_frames(&self) -> Option<u32> {
        match self {
            BufferSize::Default => None,
            BufferSize::Fixed(frames) => Some(*frames),
        }
    }
}

/// Audio device identifier: a device name plus the host backend that owns
/// it, so systems with several backends (JACK and ALSA, say) can address
/// either
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Device name as reported by the system
    pub name: String,
    /// Audio host identifier (e.g. "JACK", "ALSA", "CoreAudio");
    /// None uses the default host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
        }
    }

    pub fn with_host(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: Some(host.to_string()),
        }
    }

    /// Display label including the host when known
    pub fn display_label(&self) -> String {
        match &self.host {
            Some(host) => format!("[{}] {}", host, self.name),
            None => self.name.clone(),
        }
    }
}

/// Device layer configuration, one section of the persisted settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Playback device (None = system default)
    #[serde(default)]
    pub playback_device: Option<DeviceId>,

    /// Capture device (None = system default)
    #[serde(default)]
    pub capture_device: Option<DeviceId>,

    /// Preferred hardware buffer size
    #[serde(default)]
    pub buffer_size: BufferSize,
}

impl AudioConfig {
    pub fn with_playback_device(mut self, device: DeviceId) -> Self {
        self.playback_device = Some(device);
        self
    }

    pub fn with_capture_device(mut self, device: DeviceId) -> Self {
        self.capture_device = Some(device);
        self
    }

    pub fn with_buffer_frames(mut self, frames: u32) -> Self {
        self.buffer_size = BufferSize::Fixed(frames);
        self
    }
}
