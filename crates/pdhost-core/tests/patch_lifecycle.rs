mod common;

use std::sync::Arc;

use common::{ready, sim_host, sim_host_with, write_patch};
use pdhost_core::config::{AssetConfig, HostConfig};
use pdhost_core::engine::{EngineCall, SimEngine};
use pdhost_core::patch::{AssetSource, PatchRef};
use pdhost_core::{HostError, HostResult, PatchHost};

#[test]
fn open_returns_handle_after_extraction() {
    let bundle = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_patch(bundle.path(), "synth/main.pd");

    let config = HostConfig {
        assets: AssetConfig {
            root: bundle.path().to_path_buf(),
            extract_to: Some(cache.path().to_path_buf()),
        },
        ..HostConfig::default()
    };
    let (engine, host) = sim_host_with(config);
    ready(&host, 0);

    let id = host.patches().open(0, "synth/main.pd").unwrap().wait().unwrap();
    assert_eq!(id, 1);
    assert!(cache.path().join("synth/main.pd").is_file());
    assert!(engine.calls().contains(&EngineCall::OpenPatch {
        instance: 0,
        file: "main.pd".into(),
        dir: cache.path().join("synth"),
    }));

    let patch = host.patches().patch(0, id).unwrap().unwrap();
    assert_eq!(patch.source, cache.path().join("synth/main.pd"));
}

#[test]
fn failed_materialization_produces_no_handle() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let result = host.patches().open(0, "missing.pd").unwrap().wait();
    assert!(matches!(result, Err(HostError::PatchNotFound { .. })));
    assert!(!engine
        .calls()
        .iter()
        .any(|c| matches!(c, EngineCall::OpenPatch { .. })));
    assert!(host.patches().open_patches(0).unwrap().is_empty());
}

#[test]
fn engine_parse_failure_is_patch_not_found() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "broken.pd");
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    engine.fail("open_patch");

    let result = host.patches().open(0, "broken.pd").unwrap().wait();
    assert!(matches!(result, Err(HostError::PatchNotFound { .. })));

    // The instance keeps working after the failure
    engine.recover("open_patch");
    assert_eq!(host.patches().open(0, "broken.pd").unwrap().wait().unwrap(), 1);
}

/// Holds every extraction until the test lets it through
struct GatedAssets {
    root: std::path::PathBuf,
    gate: crossbeam::channel::Receiver<()>,
}

impl AssetSource for GatedAssets {
    fn materialize(&self, patch: &PatchRef) -> HostResult<std::path::PathBuf> {
        let _ = self.gate.recv();
        Ok(self.root.join(patch.as_path()))
    }
}

#[test]
fn open_is_pending_until_materialized() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "slow.pd");
    let (release_tx, gate) = crossbeam::channel::bounded(0);

    let engine = Arc::new(SimEngine::new());
    let assets = Arc::new(GatedAssets {
        root: dir.path().to_path_buf(),
        gate,
    });
    let host = PatchHost::with_assets(engine.clone(), HostConfig::default(), assets).unwrap();
    ready(&host, 0);

    let mut pending = host.patches().open(0, "slow.pd").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(pending.try_result().is_none());
    assert!(engine.open_patches(0).is_empty());

    release_tx.send(()).unwrap();
    assert_eq!(pending.wait().unwrap(), 1);
}

#[test]
fn open_awaits_on_runtime() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "a.pd");
    let (_engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .build()
        .unwrap();
    let id = runtime
        .block_on(async { host.patches().open(0, "a.pd")?.await })
        .unwrap();
    assert_eq!(id, 1);
}

#[test]
fn open_on_released_instance_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "a.pd");
    let (_engine, host) = sim_host(dir.path());
    ready(&host, 0);
    host.release(0).unwrap();

    assert!(matches!(
        host.patches().open(0, "a.pd"),
        Err(HostError::InvalidInstance(0))
    ));
}

#[test]
fn close_invalid_handle_keeps_instance_usable() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "a.pd");
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let id = host.patches().open_path(0, dir.path(), "a.pd").unwrap();
    host.patches().close(0, id).unwrap();
    engine.clear_calls();

    assert!(matches!(
        host.patches().close(0, id),
        Err(HostError::InvalidHandle { instance: 0, patch }) if patch == id
    ));
    assert!(matches!(
        host.patches().close(0, 99),
        Err(HostError::InvalidHandle { patch: 99, .. })
    ));
    assert!(engine.calls().is_empty());

    host.router().send_bang(0, "go").unwrap();
    assert_eq!(host.patches().open_path(0, dir.path(), "a.pd").unwrap(), 2);
}

#[test]
fn close_all_reports_previously_closed_handles() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "a.pd");
    write_patch(dir.path(), "b.pd");
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let patches = host.patches();
    assert_eq!(patches.open(0, "a.pd").unwrap().wait().unwrap(), 1);
    assert_eq!(patches.open(0, "b.pd").unwrap().wait().unwrap(), 2);
    patches.close(0, 1).unwrap();

    let report = patches.close_all(0).unwrap();
    assert_eq!(report.closed, vec![2]);
    assert!(matches!(
        report.invalid.as_slice(),
        [HostError::InvalidHandle { instance: 0, patch: 1 }]
    ));
    assert!(!report.is_clean());
    assert!(engine.open_patches(0).is_empty());
    assert!(patches.open_patches(0).unwrap().is_empty());

    // Nothing left to report on the next pass
    let again = patches.close_all(0).unwrap();
    assert!(again.closed.is_empty() && again.is_clean());
}

#[test]
fn release_closes_open_patches() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "a.pd");
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    host.patches().open(0, "a.pd").unwrap().wait().unwrap();
    engine.clear_calls();

    host.release(0).unwrap();
    assert_eq!(
        engine.calls(),
        vec![EngineCall::CloseAllPatches(0), EngineCall::Release(0)]
    );
}

#[test]
fn shutdown_stops_loader_and_instances() {
    let dir = tempfile::tempdir().unwrap();
    write_patch(dir.path(), "a.pd");
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    let patches = host.patches().clone();

    host.shutdown();
    assert!(!engine.instance_exists(0));
    assert!(matches!(
        patches.open(0, "a.pd"),
        Err(HostError::InvalidInstance(0))
    ));
    assert!(matches!(
        host.create(0, 44100),
        Err(HostError::ServiceUnavailable(_))
    ));
}
