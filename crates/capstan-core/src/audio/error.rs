//! Audio device layer error types

use thiserror::Error;

/// Errors that can occur in the device layer
#[derive(Error, Debug)]
pub enum AudioError {
    /// No audio devices available in the requested direction
    #[error("no audio devices found")]
    NoDevices,

    /// Failed to get default device
    #[error("no default audio device: {0}")]
    NoDefaultDevice(String),

    /// Device not found by name
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to read device capabilities
    #[error("could not read device configuration: {0}")]
    ConfigError(String),

    /// No configuration satisfied the stream's needs
    #[error("no usable {direction} configuration near {requested} Hz")]
    NoUsableConfig { direction: String, requested: f64 },

    /// Failed to build an audio stream
    #[error("could not build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start a built stream
    #[error("could not start audio stream: {0}")]
    StreamPlayError(String),

    /// Device offered a sample format this engine does not handle
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for device layer operations
pub type AudioResult<T> = Result<T, AudioError>;
