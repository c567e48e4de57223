//! Audio device layer
//!
//! Wraps cpal behind a small surface the transport uses: device
//! enumeration and rate probing, stream-config negotiation, and stream
//! builders that adapt whatever sample format the device insists on to
//! the `f32` callback cores.
//!
//! The design is lock-free end to end. The hardware callbacks own their
//! state exclusively; everything crossing a thread boundary travels
//! through a ring buffer or an atomic.

mod config;
mod cpal_backend;
mod device;
mod error;

pub use config::{AudioConfig, BufferSize, DeviceId, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
pub use cpal_backend::{
    build_input_stream, build_monitor_stream, build_output_stream, negotiate, StreamHandle,
};
pub use device::{
    best_rate, default_device, device_report, find_device, list_devices, resolve_device,
    supported_common_rates, supported_rates, AudioDevice, Direction, RATES_TO_TRY,
};
pub use error::{AudioError, AudioResult};
