//! Standard locations for capstan configuration files

use std::path::PathBuf;

/// Default config file path: `~/.config/capstan/transport.yaml` (or the
/// platform equivalent of the user config directory)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("capstan")
        .join("transport.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_shape() {
        let path = default_config_path();
        assert!(path.ends_with("capstan/transport.yaml"));
    }
}
