use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use connect_core::ConnectSettings;

pub fn default_settings_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".hw-connect").join("settings.json")
}

/// Reads settings from `path`, or the default location. A missing file
/// yields defaults.
pub fn load_settings(path: Option<&Path>) -> Result<ConnectSettings> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_settings_path);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConnectSettings::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_slice(&bytes).with_context(|| format!("invalid settings in {}", path.display()))
}
