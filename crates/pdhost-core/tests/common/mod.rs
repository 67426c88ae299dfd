#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pdhost_core::config::{AssetConfig, HostConfig};
use pdhost_core::engine::SimEngine;
use pdhost_core::{InstanceId, PatchHost};

pub const PATCH_SOURCE: &str = "#N canvas 0 0 450 300 12;\n#X obj 30 30 r pitch;\n";

/// Host over a fresh SimEngine with assets resolved from `assets`
pub fn sim_host(assets: &Path) -> (Arc<SimEngine>, PatchHost) {
    let config = HostConfig {
        assets: AssetConfig::direct(assets),
        ..HostConfig::default()
    };
    sim_host_with(config)
}

pub fn sim_host_with(config: HostConfig) -> (Arc<SimEngine>, PatchHost) {
    let engine = Arc::new(SimEngine::with_length_suffix(&config.length_suffix));
    let host = PatchHost::new(engine.clone(), config).unwrap();
    (engine, host)
}

/// Create `id` and wait until it is ready
pub fn ready(host: &PatchHost, id: InstanceId) {
    assert_eq!(host.create(id, 44100).unwrap().wait().unwrap(), id);
}

pub fn write_patch(dir: &Path, name: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, PATCH_SOURCE).unwrap();
}
