//! Default locations for the host's configuration and assets

use std::path::PathBuf;

/// `~/.config/pdhost/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pdhost")
        .join("config.yaml")
}

/// Directory patches are resolved against: `~/.local/share/pdhost/patches`
pub fn default_assets_root() -> PathBuf {
    data_dir().join("patches")
}

/// Where extracted assets are cached: `~/.local/share/pdhost/extracted`
pub fn default_extract_dir() -> PathBuf {
    data_dir().join("extracted")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pdhost")
}
