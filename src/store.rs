//! VersionStore: a layout-aware view over the set of installed
//! version directories, preferring an `appdata/` child over the appdir
//! root once any version has migrated there.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::manifest::{self, RelPath};
use crate::naming;
use crate::version::VersionValue;

/// One of the three durable on-disk states a version directory can be
/// observed in between operations (`Installed` is transient mid-transaction
/// and never survives to be read back, per I1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// Has `esky-files/bootstrap/` still to unpack; not yet a candidate
    /// for `get_best_version`.
    Staged,
    /// Has `bootstrap-manifest.txt` and no `-old` sibling: a candidate.
    Ready,
    /// Has `bootstrap-manifest-old.txt`: uninstalled but not yet purged.
    Disabled,
}

/// One version directory as seen by the store.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub dirname: String,
    pub name: String,
    pub version: VersionValue,
    pub platform: String,
    pub state: VersionState,
    pub path: PathBuf,
}

/// A view over the versions root of a single appdir.
pub struct VersionStore {
    appdir: PathBuf,
    app_name: String,
}

impl VersionStore {
    pub fn new(appdir: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        VersionStore {
            appdir: appdir.into(),
            app_name: app_name.into(),
        }
    }

    /// The `appdata/` child of the appdir (current layout).
    pub fn appdata_dir(&self) -> PathBuf {
        self.appdir.join("appdata")
    }

    /// The versions root actually in use: `appdata/` if it holds any
    /// version directory belonging to this app, else the appdir itself
    /// (legacy layout).
    pub fn versions_root(&self) -> PathBuf {
        let appdata = self.appdata_dir();
        if appdata.is_dir() && self.has_any_version_in(&appdata) {
            appdata
        } else {
            self.appdir.clone()
        }
    }

    /// The root a newly staged version should land in: `appdata/` if
    /// it's already the active root, else the legacy root's `appdata/`
    /// child, creating it in the process. Every install goes through
    /// here rather than `versions_root()`, so the very first install
    /// against a legacy (or virgin) appdir migrates to the current
    /// layout instead of perpetuating the legacy root forever.
    pub fn root_for_new_install(&self) -> Result<PathBuf> {
        let current = self.versions_root();
        if current == self.appdir {
            let appdata = self.appdata_dir();
            fs::create_dir_all(&appdata)?;
            Ok(appdata)
        } else {
            Ok(current)
        }
    }

    /// True once an `appdata/` child exists at all, regardless of
    /// whether it currently holds a version — used by `CleanupEngine`'s
    /// layout-migration step to decide if migration is even relevant.
    pub fn appdata_exists(&self) -> bool {
        self.appdata_dir().is_dir()
    }

    /// True if the legacy root (the appdir itself) holds any version
    /// belonging to this app. Used to detect "still needs migrating".
    pub fn legacy_root_has_versions(&self) -> bool {
        self.has_any_version_in(&self.appdir)
    }

    fn has_any_version_in(&self, dir: &Path) -> bool {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return false,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if naming::belongs_to(name, &self.app_name) {
                    return true;
                }
            }
        }
        false
    }

    /// Enumerate every version directory belonging to this app under the
    /// active versions root, in no particular order.
    pub fn list_all(&self) -> Result<Vec<VersionEntry>> {
        self.list_all_in(&self.versions_root())
    }

    fn list_all_in(&self, root: &Path) -> Result<Vec<VersionEntry>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dirname = match entry.file_name().into_string() {
                Ok(s) => s,
                Err(_) => continue,
            };
            let (name, version_str, platform) = match naming::split(&dirname) {
                Ok(parts) => parts,
                Err(_) => continue,
            };
            if name != self.app_name {
                continue;
            }
            let version = match VersionValue::parse(&version_str) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let path = entry.path();
            let state = match classify(&path) {
                Some(s) => s,
                None => continue,
            };
            out.push(VersionEntry {
                dirname,
                name,
                version,
                platform,
                state,
                path,
            });
        }
        Ok(out)
    }

    /// The highest version in `Ready` state (or `Staged`/`Disabled` too
    /// when `include_partial` is set — `include_partial` widens the
    /// candidate pool to "any state at or above `Installed`", which in
    /// durable terms means "anything that's at least Staged").
    pub fn get_best_version(&self, include_partial: bool) -> Result<Option<VersionEntry>> {
        let mut candidates = self.list_all()?;
        candidates.retain(|v| match v.state {
            VersionState::Ready => true,
            VersionState::Staged => include_partial,
            VersionState::Disabled => false,
        });
        candidates.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(candidates.into_iter().last())
    }

    /// Read the bootstrap manifest of a version directory; empty set if
    /// missing.
    pub fn manifest_of(&self, dirname: &str) -> Result<BTreeSet<RelPath>> {
        let path = self
            .versions_root()
            .join(dirname)
            .join("esky-files")
            .join("bootstrap-manifest.txt");
        manifest::read_manifest(&path)
    }

    pub fn version_path(&self, dirname: &str) -> PathBuf {
        self.versions_root().join(dirname)
    }
}

/// Classify a version directory's durable state from what control files
/// are present, or `None` if it has neither manifest (not a real
/// `InstalledVersion` yet — e.g. mid `ABSENT -> STAGED` rename).
fn classify(version_dir: &Path) -> Option<VersionState> {
    let esky_files = version_dir.join("esky-files");
    let manifest = esky_files.join("bootstrap-manifest.txt");
    let manifest_old = esky_files.join("bootstrap-manifest-old.txt");
    let bootstrap = esky_files.join("bootstrap");

    if manifest_old.is_file() {
        Some(VersionState::Disabled)
    } else if manifest.is_file() {
        if bootstrap.is_dir() {
            Some(VersionState::Staged)
        } else {
            Some(VersionState::Ready)
        }
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_version(root: &Path, name: &str, version: &str, platform: &str, state: VersionState) {
        let dirname = naming::join(name, version, platform);
        let dir = root.join(&dirname);
        let esky_files = dir.join("esky-files");
        fs::create_dir_all(&esky_files).unwrap();
        match state {
            VersionState::Staged => {
                fs::write(esky_files.join("bootstrap-manifest.txt"), "bin/app\n").unwrap();
                fs::create_dir_all(esky_files.join("bootstrap")).unwrap();
            }
            VersionState::Ready => {
                fs::write(esky_files.join("bootstrap-manifest.txt"), "bin/app\n").unwrap();
            }
            VersionState::Disabled => {
                fs::write(esky_files.join("bootstrap-manifest-old.txt"), "bin/app\n").unwrap();
            }
        }
    }

    #[test]
    fn best_version_excludes_staged_by_default() {
        let dir = tempdir().unwrap();
        make_version(dir.path(), "app", "1.0.0", "linux-x86_64", VersionState::Ready);
        make_version(dir.path(), "app", "1.1.0", "linux-x86_64", VersionState::Staged);
        let store = VersionStore::new(dir.path(), "app");
        let best = store.get_best_version(false).unwrap().unwrap();
        assert_eq!(best.version.as_str(), "1.0.0");
        let best_partial = store.get_best_version(true).unwrap().unwrap();
        assert_eq!(best_partial.version.as_str(), "1.1.0");
    }

    #[test]
    fn disabled_versions_are_never_best() {
        let dir = tempdir().unwrap();
        make_version(dir.path(), "app", "1.0.0", "linux-x86_64", VersionState::Disabled);
        let store = VersionStore::new(dir.path(), "app");
        assert!(store.get_best_version(false).unwrap().is_none());
        assert!(store.get_best_version(true).unwrap().is_none());
    }

    #[test]
    fn prefers_appdata_child_when_it_has_versions() {
        let dir = tempdir().unwrap();
        let appdata = dir.path().join("appdata");
        fs::create_dir_all(&appdata).unwrap();
        make_version(&appdata, "app", "2.0.0", "linux-x86_64", VersionState::Ready);
        make_version(dir.path(), "app", "1.0.0", "linux-x86_64", VersionState::Ready);
        let store = VersionStore::new(dir.path(), "app");
        assert_eq!(store.versions_root(), appdata);
        let best = store.get_best_version(false).unwrap().unwrap();
        assert_eq!(best.version.as_str(), "2.0.0");
    }

    #[test]
    fn ignores_other_apps() {
        let dir = tempdir().unwrap();
        make_version(dir.path(), "other", "9.9.9", "linux-x86_64", VersionState::Ready);
        let store = VersionStore::new(dir.path(), "app");
        assert!(store.get_best_version(false).unwrap().is_none());
    }
}
