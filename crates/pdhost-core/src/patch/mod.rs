//! Patch lifecycle - open and close patch files inside an instance
//!
//! Opening is a two-step job: the [`AssetSource`] materializes the patch
//! reference into a plain file, then the engine opens it. Both steps run
//! on the `patch-loader` thread, so [`PatchManager::open`] hands back a
//! [`PendingPatch`] instead of a patch id.
//!
//! Handles are tracked per instance. A handle is valid from the moment the
//! engine returns it until it is closed or the instance is released.

mod assets;
pub(crate) mod loader;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use crossbeam::channel::Sender;

use crate::error::{ensure, HostError, HostResult};
use crate::host::HostShared;
use crate::pending::PendingPatch;
use crate::types::{InstanceId, PatchId};

pub use assets::{AssetSource, DirectAssets, ExtractingAssets, PatchRef};
use loader::LoaderCommand;

/// An open patch
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub id: PatchId,
    /// File the engine opened
    pub source: PathBuf,
    pub opened_at: DateTime<Local>,
}

/// Open handles of one instance
#[derive(Debug, Default)]
pub struct PatchTable {
    open: BTreeMap<PatchId, Patch>,
    /// Closed individually since the last `close_all`
    retired: BTreeSet<PatchId>,
}

impl PatchTable {
    pub fn insert(&mut self, patch: Patch) {
        self.retired.remove(&patch.id);
        self.open.insert(patch.id, patch);
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.open.get(&id)
    }

    pub fn is_open(&self, id: PatchId) -> bool {
        self.open.contains_key(&id)
    }

    /// Stop tracking an open handle, remembering it as closed
    pub fn retire(&mut self, id: PatchId) -> Option<Patch> {
        let patch = self.open.remove(&id)?;
        self.retired.insert(id);
        Some(patch)
    }

    /// Take every open patch and every retired handle
    pub fn take_all(&mut self) -> (Vec<Patch>, Vec<PatchId>) {
        let open = std::mem::take(&mut self.open).into_values().collect();
        let retired = std::mem::take(&mut self.retired).into_iter().collect();
        (open, retired)
    }

    pub fn patches(&self) -> impl Iterator<Item = &Patch> {
        self.open.values()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn clear(&mut self) {
        self.open.clear();
        self.retired.clear();
    }
}

/// Outcome of [`PatchManager::close_all`]
#[derive(Debug, Default)]
pub struct CloseAllReport {
    /// Handles closed by this call
    pub closed: Vec<PatchId>,
    /// `InvalidHandle` for every handle that could not be closed, including
    /// ones already closed individually
    pub invalid: Vec<HostError>,
}

impl CloseAllReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Opens and closes patches on behalf of callers
#[derive(Clone)]
pub struct PatchManager {
    shared: Arc<HostShared>,
    loader: Sender<LoaderCommand>,
}

impl PatchManager {
    pub(crate) fn new(shared: Arc<HostShared>, loader: Sender<LoaderCommand>) -> Self {
        Self { shared, loader }
    }

    /// Materialize `patch` and open it in `instance`
    ///
    /// Fails immediately with `InvalidInstance` if the instance is not live.
    /// The returned handle resolves to the patch id, or to `PatchNotFound`
    /// when the asset cannot be materialized or the engine cannot open it.
    pub fn open(
        &self,
        instance: InstanceId,
        patch: impl Into<PatchRef>,
    ) -> HostResult<PendingPatch> {
        let patch = patch.into();
        self.shared.registry.with_live(instance, |_, _| Ok(()))?;

        let (reply, pending) = PendingPatch::channel("patch open");
        log::debug!("Instance {}: queueing open of {}", instance, patch);
        self.loader
            .send(LoaderCommand::Open {
                instance,
                patch,
                reply,
            })
            .map_err(|_| HostError::ServiceUnavailable("patch loader is not running".to_string()))?;

        Ok(pending)
    }

    /// Open a patch that is already a plain file (`dir` doubles as search path)
    pub fn open_path(&self, instance: InstanceId, dir: &Path, file: &str) -> HostResult<PatchId> {
        open_file(&self.shared, instance, dir, file)
    }

    /// Close one patch; unknown or already-closed handles fail with `InvalidHandle`
    pub fn close(&self, instance: InstanceId, patch: PatchId) -> HostResult<()> {
        let engine = &self.shared.engine;
        self.shared.registry.with_live(instance, |_, data| {
            if !data.patches.is_open(patch) {
                let err = HostError::InvalidHandle { instance, patch };
                log::warn!("{}", err);
                return Err(err);
            }

            let ok = engine.close_patch(instance, patch);
            data.patches.retire(patch);
            ensure(ok, || HostError::InvalidHandle { instance, patch })?;

            log::info!("Instance {}: closed patch {}", instance, patch);
            Ok(())
        })
    }

    /// Close every tracked patch, collecting failures instead of stopping at them
    pub fn close_all(&self, instance: InstanceId) -> HostResult<CloseAllReport> {
        let engine = &self.shared.engine;
        self.shared.registry.with_live(instance, |_, data| {
            let (open, retired) = data.patches.take_all();
            let mut report = CloseAllReport::default();

            for patch in retired {
                log::debug!("Instance {}: patch {} was already closed", instance, patch);
                report.invalid.push(HostError::InvalidHandle { instance, patch });
            }

            for patch in open {
                if engine.close_patch(instance, patch.id) {
                    report.closed.push(patch.id);
                } else {
                    let err = HostError::InvalidHandle {
                        instance,
                        patch: patch.id,
                    };
                    log::warn!("{}", err);
                    report.invalid.push(err);
                }
            }

            log::info!(
                "Instance {}: closed {} patches ({} invalid handles)",
                instance,
                report.closed.len(),
                report.invalid.len()
            );
            Ok(report)
        })
    }

    pub fn patch(&self, instance: InstanceId, patch: PatchId) -> HostResult<Option<Patch>> {
        self.shared
            .registry
            .with_live(instance, |_, data| Ok(data.patches.get(patch).cloned()))
    }

    pub fn open_patches(&self, instance: InstanceId) -> HostResult<Vec<Patch>> {
        self.shared
            .registry
            .with_live(instance, |_, data| Ok(data.patches.patches().cloned().collect()))
    }
}

/// Open `dir/file` in `instance` and start tracking the handle
pub(crate) fn open_file(
    shared: &HostShared,
    instance: InstanceId,
    dir: &Path,
    file: &str,
) -> HostResult<PatchId> {
    shared.registry.with_live(instance, |_, data| {
        let source = dir.join(file);
        let Some(id) = shared.engine.open_patch(instance, file, dir) else {
            let err = HostError::PatchNotFound {
                path: source,
                reason: "engine could not open the patch".to_string(),
            };
            log::warn!("Instance {}: {}", instance, err);
            return Err(err);
        };

        log::info!("Instance {}: opened patch {} from {:?}", instance, id, source);
        data.patches.insert(Patch {
            id,
            source,
            opened_at: Local::now(),
        });
        Ok(id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(id: PatchId) -> Patch {
        Patch {
            id,
            source: PathBuf::from(format!("/tmp/{}.pd", id)),
            opened_at: Local::now(),
        }
    }

    #[test]
    fn test_retire_tracks_closed_handles() {
        let mut table = PatchTable::default();
        table.insert(patch(1));
        table.insert(patch(2));

        assert!(table.retire(1).is_some());
        assert!(table.retire(1).is_none());
        assert!(!table.is_open(1));

        let (open, retired) = table.take_all();
        assert_eq!(open.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(retired, vec![1]);
        assert!(table.is_empty());
        assert_eq!(table.take_all().1, Vec::<PatchId>::new());
    }

    #[test]
    fn test_reopened_id_is_no_longer_retired() {
        let mut table = PatchTable::default();
        table.insert(patch(1));
        table.retire(1);
        table.insert(patch(1));
        let (_, retired) = table.take_all();
        assert!(retired.is_empty());
    }
}
