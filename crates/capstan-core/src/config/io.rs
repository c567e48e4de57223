//! Generic YAML configuration loading and saving
//!
//! Loading never fails: a missing or unparseable file yields the default
//! configuration with a logged warning, so a damaged config can not keep
//! the engine from starting.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load a configuration from a YAML file, falling back to defaults when
/// the file is missing or malformed
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("no config at {path:?}, using defaults");
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => {
                log::info!("loaded config from {path:?}");
                config
            }
            Err(err) => {
                log::warn!("could not parse {path:?}: {err}, using defaults");
                T::default()
            }
        },
        Err(err) => {
            log::warn!("could not read {path:?}: {err}, using defaults");
            T::default()
        }
    }
}

/// Save a configuration as YAML, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let yaml = serde_yaml::to_string(config).context("serializing config")?;
    std::fs::write(path, yaml).with_context(|| format!("writing config file {path:?}"))?;

    log::info!("saved config to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let settings: TransportSettings =
            load_config(Path::new("/nonexistent/capstan/config.yaml"));
        assert_eq!(settings.latency_correction_ms, -130.0);
    }

    #[test]
    fn test_load_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "playthrough: [not, a, bool]").unwrap();

        let settings: TransportSettings = load_config(&path);
        assert!(!settings.playthrough);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directories are created on demand
        let path = dir.path().join("nested").join("config.yaml");

        let mut settings = TransportSettings::default();
        settings.playthrough = true;
        settings.preferred_rate = Some(48000.0);
        save_config(&settings, &path).unwrap();

        let loaded: TransportSettings = load_config(&path);
        assert!(loaded.playthrough);
        assert_eq!(loaded.preferred_rate, Some(48000.0));
    }
}
