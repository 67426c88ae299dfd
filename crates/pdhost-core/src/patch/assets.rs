//! Asset sources - turn a patch reference into a plain file the engine can read
//!
//! Bundled assets may live somewhere the engine cannot open directly (a
//! packed application bundle, a read-only mount). [`ExtractingAssets`]
//! copies them into a writable cache first; [`DirectAssets`] is used when
//! the files are already on disk.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{HostError, HostResult};

/// A patch file addressed relative to an asset root, e.g. `synth/main.pd`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchRef(PathBuf);

impl PatchRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Relative, and never escapes the asset root
    pub fn is_contained(&self) -> bool {
        self.0.file_name().is_some()
            && self
                .0
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    }
}

impl From<&str> for PatchRef {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for PatchRef {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl fmt::Display for PatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Supplies plain filesystem paths for bundled patch assets
///
/// `materialize` may perform blocking I/O; the host only calls it from the
/// patch-loader thread.
pub trait AssetSource: Send + Sync {
    /// Path of a readable file holding the patch
    fn materialize(&self, patch: &PatchRef) -> HostResult<PathBuf>;
}

fn not_found(path: PathBuf, reason: impl Into<String>) -> HostError {
    HostError::PatchNotFound {
        path,
        reason: reason.into(),
    }
}

fn checked(root: &Path, patch: &PatchRef) -> HostResult<PathBuf> {
    if !patch.is_contained() {
        return Err(not_found(
            patch.as_path().to_path_buf(),
            "patch reference must be relative to the asset root",
        ));
    }
    Ok(root.join(patch.as_path()))
}

/// Assets that are already plain files under `root`
#[derive(Debug, Clone)]
pub struct DirectAssets {
    root: PathBuf,
}

impl DirectAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirectAssets {
    fn materialize(&self, patch: &PatchRef) -> HostResult<PathBuf> {
        let path = checked(&self.root, patch)?;
        if !path.is_file() {
            return Err(not_found(path, "no such file"));
        }
        Ok(path)
    }
}

/// Assets copied from `bundle` into `cache` on first use
#[derive(Debug, Clone)]
pub struct ExtractingAssets {
    bundle: PathBuf,
    cache: PathBuf,
}

impl ExtractingAssets {
    pub fn new(bundle: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
        Self {
            bundle: bundle.into(),
            cache: cache.into(),
        }
    }

    pub fn cache(&self) -> &Path {
        &self.cache
    }
}

impl AssetSource for ExtractingAssets {
    fn materialize(&self, patch: &PatchRef) -> HostResult<PathBuf> {
        let target = checked(&self.cache, patch)?;
        if target.is_file() {
            log::debug!("Asset {} already extracted to {:?}", patch, target);
            return Ok(target);
        }

        let source = checked(&self.bundle, patch)?;
        if !source.is_file() {
            return Err(not_found(source, "not present in asset bundle"));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                not_found(target.clone(), format!("cannot create cache directory: {}", e))
            })?;
        }
        let bytes = fs::copy(&source, &target)
            .map_err(|e| not_found(target.clone(), format!("extraction failed: {}", e)))?;

        log::info!("Extracted {} ({} bytes) to {:?}", patch, bytes, target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_ref_containment() {
        assert!(PatchRef::from("synth/main.pd").is_contained());
        assert!(PatchRef::from("./main.pd").is_contained());
        assert!(!PatchRef::from("../main.pd").is_contained());
        assert!(!PatchRef::from("/etc/main.pd").is_contained());
        assert!(!PatchRef::from("").is_contained());
    }

    #[test]
    fn test_direct_assets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pd"), "#N canvas;\n").unwrap();

        let assets = DirectAssets::new(dir.path());
        assert_eq!(
            assets.materialize(&"a.pd".into()).unwrap(),
            dir.path().join("a.pd")
        );
        assert!(matches!(
            assets.materialize(&"b.pd".into()),
            Err(HostError::PatchNotFound { .. })
        ));
        assert!(matches!(
            assets.materialize(&"../a.pd".into()),
            Err(HostError::PatchNotFound { .. })
        ));
    }

    #[test]
    fn test_extracting_assets_copies_once() {
        let bundle = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::create_dir_all(bundle.path().join("synth")).unwrap();
        fs::write(bundle.path().join("synth/main.pd"), "v1").unwrap();

        let assets = ExtractingAssets::new(bundle.path(), cache.path().join("extracted"));
        let path = assets.materialize(&"synth/main.pd".into()).unwrap();
        assert_eq!(path, cache.path().join("extracted/synth/main.pd"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "v1");

        // Cached copy wins over a changed bundle
        fs::write(bundle.path().join("synth/main.pd"), "v2").unwrap();
        let again = assets.materialize(&"synth/main.pd".into()).unwrap();
        assert_eq!(fs::read_to_string(again).unwrap(), "v1");
    }

    #[test]
    fn test_extracting_missing_asset() {
        let bundle = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let assets = ExtractingAssets::new(bundle.path(), cache.path());

        let err = assets.materialize(&"missing.pd".into()).unwrap_err();
        assert!(matches!(err, HostError::PatchNotFound { .. }));
        assert!(!cache.path().join("missing.pd").exists());
    }
}
