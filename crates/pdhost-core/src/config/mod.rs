//! Host configuration
//!
//! ```ignore
//! use pdhost_core::config::{default_config_path, load_config, HostConfig};
//!
//! let config: HostConfig = load_config(&default_config_path());
//! let host = PatchHost::new(engine, config)?;
//! ```

mod io;
mod paths;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::patch::{AssetSource, DirectAssets, ExtractingAssets};
use crate::types::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

pub use io::{load_config, save_config};
pub use paths::{default_assets_root, default_config_path, default_extract_dir};

/// Engine and asset settings for a [`crate::PatchHost`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Sample rate for instances created without an explicit rate
    /// Default: 44100
    pub sample_rate: u32,

    /// Default: 2
    pub input_channels: u32,

    /// Default: 2
    pub output_channels: u32,

    /// Appended to an array name to form its size receiver
    /// Default: "_length" (array `sample0` is sized via `sample0_length`)
    pub length_suffix: String,

    pub assets: AssetConfig,

    /// Extra directories the engine searches for abstractions
    pub search_paths: Vec<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            input_channels: DEFAULT_CHANNELS,
            output_channels: DEFAULT_CHANNELS,
            length_suffix: "_length".to_string(),
            assets: AssetConfig::default(),
            search_paths: Vec::new(),
        }
    }
}

/// Where patch assets come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Root that patch references are resolved against
    pub root: PathBuf,

    /// When set, assets are copied here before opening
    pub extract_to: Option<PathBuf>,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            root: default_assets_root(),
            extract_to: None,
        }
    }
}

impl AssetConfig {
    pub fn direct(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extract_to: None,
        }
    }

    /// Build the asset source this configuration describes
    pub fn source(&self) -> Arc<dyn AssetSource> {
        match &self.extract_to {
            Some(cache) => Arc::new(ExtractingAssets::new(&self.root, cache)),
            None => Arc::new(DirectAssets::new(&self.root)),
        }
    }
}
