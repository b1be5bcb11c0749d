//! # Asset Bundles
//!
//! The master's on-disk bundle catalog and the client's loading hook.
//!
//! ```text
//! <root_dir>/
//!   AssetBundlesAndroid/   networkBundle_room  networkBundle_room.manifest
//!   AssetBundlesHololens/  ...
//!   AssetBundlesPC/        ...
//! ```
//!
//! A file is a bundle when its name contains `name_filter` and does not end
//! with any of `exclude_suffixes`. Bundles are built elsewhere and are
//! read-only here.

use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use roommesh_core::Platform;
use tracing::debug;

use crate::config::BundleSettings;
use crate::error::{SyncError, SyncResult};

/// One bundle file selected for a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub platform: Platform,

    /// Path relative to the bundle root, `/`-separated. Sent to clients.
    pub name: String,

    /// Absolute path on the master.
    pub path: PathBuf,
}

/// Lists and reads platform bundles under a root directory.
#[derive(Debug, Clone)]
pub struct BundleCatalog {
    settings: BundleSettings,
}

impl BundleCatalog {
    pub fn new(settings: BundleSettings) -> Self {
        BundleCatalog { settings }
    }

    fn is_bundle(&self, file_name: &str) -> bool {
        file_name.contains(&self.settings.name_filter)
            && !self
                .settings
                .exclude_suffixes
                .iter()
                .any(|suffix| file_name.ends_with(suffix.as_str()))
    }

    /// Bundles for `platform`, sorted by name.
    ///
    /// A missing platform directory yields an empty list.
    pub fn list(&self, platform: Platform) -> SyncResult<Vec<BundleEntry>> {
        let dir = self.settings.root_dir.join(platform.bundle_dir());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "No bundle directory for platform");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SyncError::BundleRead {
                    path: dir.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let mut bundles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::BundleRead {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !self.is_bundle(&file_name) {
                continue;
            }
            bundles.push(BundleEntry {
                platform,
                name: format!("{}/{}", platform.bundle_dir(), file_name),
                path: entry.path(),
            });
        }
        bundles.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(platform = %platform, count = bundles.len(), "Listed bundles");
        Ok(bundles)
    }

    /// Reads one bundle's bytes.
    pub async fn read(&self, entry: &BundleEntry) -> SyncResult<Bytes> {
        tokio::fs::read(&entry.path)
            .await
            .map(Bytes::from)
            .map_err(|e| SyncError::BundleRead {
                path: entry.path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// Bundle Sink
// =============================================================================

/// Client-side hook receiving each downloaded bundle.
///
/// Implemented by the host's bundle loader.
pub trait BundleSink: Send + Sync {
    fn load(&self, platform: Platform, name: &str, bytes: Bytes) -> SyncResult<()>;
}

/// Sink that drops every bundle.
pub struct DiscardBundles;

impl BundleSink for DiscardBundles {
    fn load(&self, _platform: Platform, _name: &str, _bytes: Bytes) -> SyncResult<()> {
        Ok(())
    }
}

/// Sink that keeps every bundle in memory, in arrival order.
#[derive(Default)]
pub struct MemoryBundleSink {
    loaded: Mutex<Vec<(String, Bytes)>>,
}

impl MemoryBundleSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names and bytes received so far.
    pub fn loaded(&self) -> Vec<(String, Bytes)> {
        self.loaded
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl BundleSink for MemoryBundleSink {
    fn load(&self, _platform: Platform, name: &str, bytes: Bytes) -> SyncResult<()> {
        self.loaded
            .lock()
            .map_err(|_| SyncError::Internal("bundle sink lock poisoned".into()))?
            .push((name.to_string(), bytes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("roommesh-bundles-{}", uuid::Uuid::new_v4()))
    }

    fn write(root: &PathBuf, platform: Platform, name: &str, bytes: &[u8]) {
        let dir = root.join(platform.bundle_dir());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    fn catalog(root: &PathBuf) -> BundleCatalog {
        BundleCatalog::new(BundleSettings {
            root_dir: root.clone(),
            ..BundleSettings::default()
        })
    }

    #[test]
    fn test_selects_bundles_and_skips_sidecars() {
        let root = temp_root();
        write(&root, Platform::Desktop, "networkBundle_room", b"pc");
        write(&root, Platform::Desktop, "networkBundle_room.manifest", b"x");
        write(&root, Platform::Desktop, "networkBundle_room.meta", b"x");
        write(&root, Platform::Desktop, "unrelated.bin", b"x");
        write(&root, Platform::Desktop, "a_networkBundle_props", b"pc2");

        let names: Vec<_> = catalog(&root)
            .list(Platform::Desktop)
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(
            names,
            ["AssetBundlesPC/a_networkBundle_props", "AssetBundlesPC/networkBundle_room"]
        );

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_missing_platform_dir_is_empty() {
        let root = temp_root();
        write(&root, Platform::Android, "networkBundle_room", b"android");
        assert!(catalog(&root).list(Platform::HoloLens).unwrap().is_empty());
        assert_eq!(catalog(&root).list(Platform::Android).unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_read_bundle() {
        let root = temp_root();
        write(&root, Platform::HoloLens, "networkBundle_room", b"holo-bytes");
        let catalog = catalog(&root);
        let entry = catalog.list(Platform::HoloLens).unwrap().remove(0);
        assert_eq!(catalog.read(&entry).await.unwrap().as_ref(), b"holo-bytes");
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryBundleSink::new();
        sink.load(Platform::Android, "b", Bytes::from_static(b"2")).unwrap();
        sink.load(Platform::Android, "a", Bytes::from_static(b"1")).unwrap();
        let names: Vec<_> = sink.loaded().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["b", "a"]);
    }
}
