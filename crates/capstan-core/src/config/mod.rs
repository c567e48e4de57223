//! Engine configuration
//!
//! [`TransportSettings`] is the persistent half of the engine's
//! behavior: device selection, dropout detection, latency and clock
//! constants. The per-stream half travels in
//! [`StartStreamOptions`](crate::schedule::StartStreamOptions).
//!
//! Configuration is YAML on disk. [`load_config`] is total: missing or
//! damaged files fall back to defaults so the engine always starts.

mod io;
mod paths;
mod settings;

pub use io::{load_config, save_config};
pub use paths::default_config_path;
pub use settings::TransportSettings;
