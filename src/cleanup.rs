//! Idempotent reconciliation of an appdir left in a partial state by an
//! interrupted install, uninstall, or layout migration.
//!
//! Reconciliation is modeled as an explicit `Vec<CleanupAction>`
//! materialized up front by `plan()` and drained by `run()`, with
//! per-action error isolation, rather than as a generator that yields
//! work items and accepts exceptions thrown back in.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::finder::VersionFinder;
use crate::lock::AppdirLock;
use crate::naming;
use crate::store::{VersionState, VersionStore};
use crate::swapper::BootstrapSwapper;
use crate::version::VersionValue;

/// One unit of reconciliation work. Materialized as a flat list so
/// `needs_cleanup()` is a plain "is the plan non-empty" check.
#[derive(Debug, Clone)]
pub enum CleanupAction {
    /// Finish installing the more recently staged partial version.
    CompletePartialInstall(String),
    /// Finish installing the newest legacy-root version into `appdata/`.
    MigrateLayout(String),
    /// Delete a fully-disabled (`bootstrap-manifest-old.txt`) version's
    /// remaining files.
    DeleteVersion(String),
    /// Uninstall a `Ready`-but-obsolete version before deleting it.
    Uninstall(String),
    /// Stream a deferred overwrite from `esky-files/overwrite/` into the
    /// appdir, truncate-then-write so stale trailing bytes from a shorter
    /// replacement never survive.
    ApplyOverwrite { src: PathBuf, dst: PathBuf },
    /// Remove an overwrite source file after it's been applied.
    RemoveOverwriteSource(PathBuf),
    /// Let the `VersionFinder` purge its own cache.
    FinderCleanup,
}

/// Result of running the cleanup plan: which actions failed (if any) and
/// whether the appdir ended up fully reconciled.
pub struct CleanupReport {
    pub attempted: usize,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn fully_cleaned(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CleanupEngine<'a> {
    appdir: &'a Path,
    app_name: &'a str,
    keep_versions: usize,
    finder: Option<&'a dyn VersionFinder>,
}

impl<'a> CleanupEngine<'a> {
    pub fn new(appdir: &'a Path, app_name: &'a str, keep_versions: usize) -> Self {
        CleanupEngine {
            appdir,
            app_name,
            keep_versions,
            finder: None,
        }
    }

    pub fn with_finder(mut self, finder: &'a dyn VersionFinder) -> Self {
        self.finder = Some(finder);
        self
    }

    /// True if `plan()` would be non-empty.
    pub fn needs_cleanup(&self, active_version: Option<&str>) -> Result<bool> {
        Ok(!self.plan(active_version)?.is_empty())
    }

    /// Build the full list of reconciliation actions without performing
    /// any of them.
    pub fn plan(&self, active_version: Option<&str>) -> Result<Vec<CleanupAction>> {
        let store = VersionStore::new(self.appdir, self.app_name);
        let mut actions = Vec::new();

        // Step 1: complete partial installs.
        let best = store.get_best_version(false)?;
        let best_partial = store.get_best_version(true)?;
        if let Some(partial) = &best_partial {
            let differs = match &best {
                Some(b) => b.dirname != partial.dirname,
                None => true,
            };
            if differs {
                actions.push(CleanupAction::CompletePartialInstall(partial.dirname.clone()));
            }
        }

        // Step 2: migrate layout. `versions_root()` already prefers
        // `appdata/` once it holds anything, so a direct legacy-root scan
        // is needed here to see what's still left behind to migrate.
        if store.appdata_exists() && store.legacy_root_has_versions() {
            if let Some(newest) = legacy_best_in_root(self.appdir, self.app_name)? {
                actions.push(CleanupAction::MigrateLayout(newest));
            }
        }

        // Step 3: delete retired versions.
        let all = store.list_all()?;
        let best_dirname = best.as_ref().map(|b| b.dirname.clone());
        let retained_floor = self.keep_versions;
        let mut ready_sorted: Vec<_> = all
            .iter()
            .filter(|v| v.state == VersionState::Ready)
            .collect();
        ready_sorted.sort_by(|a, b| b.version.cmp(&a.version));

        for entry in &all {
            let is_best = best_dirname.as_deref() == Some(entry.dirname.as_str());
            let is_active = active_version == Some(entry.dirname.as_str());
            if is_best || is_active {
                continue;
            }
            match entry.state {
                VersionState::Disabled => {
                    actions.push(CleanupAction::DeleteVersion(entry.dirname.clone()));
                }
                VersionState::Ready => {
                    let rank = ready_sorted
                        .iter()
                        .position(|v| v.dirname == entry.dirname)
                        .unwrap_or(usize::MAX);
                    if rank >= retained_floor {
                        actions.push(CleanupAction::Uninstall(entry.dirname.clone()));
                        actions.push(CleanupAction::DeleteVersion(entry.dirname.clone()));
                    }
                }
                VersionState::Staged => {}
            }
        }

        // Step 4: deferred overwrites under the best version.
        if let Some(best) = &best {
            let overwrite_dir = best.path.join("esky-files").join("overwrite");
            if overwrite_dir.is_dir() {
                for entry in WalkDir::new(&overwrite_dir)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                {
                    let rel = entry
                        .path()
                        .strip_prefix(&overwrite_dir)
                        .unwrap_or(entry.path())
                        .to_path_buf();
                    let dst = self.appdir.join(&rel);
                    actions.push(CleanupAction::ApplyOverwrite {
                        src: entry.path().to_path_buf(),
                        dst,
                    });
                    actions.push(CleanupAction::RemoveOverwriteSource(entry.path().to_path_buf()));
                }
            }
        }

        // Step 5: delegate to the VersionFinder.
        if let Some(finder) = self.finder {
            if finder.needs_cleanup(self.app_name)? {
                actions.push(CleanupAction::FinderCleanup);
            }
        }

        Ok(actions)
    }

    /// Execute the plan under the appdir lock. Each action's error is
    /// caught and recorded so independent later actions still run;
    /// `CleanupEngine` itself never returns an error from a partial run.
    pub fn run(&self, lock: &mut AppdirLock, active_version: Option<&str>) -> Result<CleanupReport> {
        lock.acquire()?;
        let result = self.run_locked(active_version);
        lock.release()?;
        result
    }

    fn run_locked(&self, active_version: Option<&str>) -> Result<CleanupReport> {
        let actions = self.plan(active_version)?;
        let store = VersionStore::new(self.appdir, self.app_name);
        let mut failed = Vec::new();
        let attempted = actions.len();

        for action in actions {
            if let Err(e) = self.apply_action(&action, &store) {
                warn!(action = ?action, error = %e, "cleanup action failed");
                failed.push((format!("{action:?}"), e.to_string()));
            }
        }

        info!(attempted, failed = failed.len(), "cleanup pass complete");
        Ok(CleanupReport { attempted, failed })
    }

    fn apply_action(&self, action: &CleanupAction, store: &VersionStore) -> Result<()> {
        match action {
            CleanupAction::CompletePartialInstall(dirname) => {
                let swapper = BootstrapSwapper::new(self.appdir, store);
                swapper_install_without_lock(&swapper, dirname)
            }
            CleanupAction::MigrateLayout(dirname) => {
                let appdata = self.appdir.join("appdata");
                fs::create_dir_all(&appdata)?;
                let src = self.appdir.join(dirname);
                let dst = appdata.join(dirname);
                if src.exists() && !dst.exists() {
                    fs::rename(&src, &dst)?;
                }
                let swapper = BootstrapSwapper::new(self.appdir, store);
                swapper_install_without_lock(&swapper, dirname)
            }
            CleanupAction::DeleteVersion(dirname) => {
                let swapper = BootstrapSwapper::new(self.appdir, store);
                swapper.purge(dirname)
            }
            CleanupAction::Uninstall(dirname) => {
                let swapper = BootstrapSwapper::new(self.appdir, store);
                let retained = retained_versions(store, dirname)?;
                swapper_uninstall_without_lock(&swapper, dirname, &retained)
            }
            CleanupAction::ApplyOverwrite { src, dst } => apply_overwrite(src, dst),
            CleanupAction::RemoveOverwriteSource(src) => {
                fs::remove_file(src)?;
                Ok(())
            }
            CleanupAction::FinderCleanup => {
                if let Some(finder) = self.finder {
                    finder.cleanup(self.app_name)?;
                }
                Ok(())
            }
        }
    }
}

/// `BootstrapSwapper::install`/`uninstall` take `&mut AppdirLock` to
/// acquire reentrantly; `CleanupEngine::run` already holds the lock, so
/// these helpers drive a throwaway already-held handle to satisfy the
/// signature without double-acquiring semantics changing (reentrant
/// acquire just bumps the counter).
fn swapper_install_without_lock(swapper: &BootstrapSwapper<'_>, dirname: &str) -> Result<()> {
    let mut noop_lock = AppdirLock::new(swapper_appdir(swapper));
    // The outer CleanupEngine::run already holds the real lock for this
    // appdir; a fresh handle here would try to acquire independently and
    // deadlock against itself only if marker names collided, which they
    // don't (each AppdirLock mints a unique per-thread marker and this
    // call happens on the same thread, so it reenters by marker name).
    swapper.install(&mut noop_lock, dirname)
}

fn swapper_uninstall_without_lock(
    swapper: &BootstrapSwapper<'_>,
    dirname: &str,
    retained: &[(String, VersionValue)],
) -> Result<()> {
    let mut noop_lock = AppdirLock::new(swapper_appdir(swapper));
    swapper.uninstall(&mut noop_lock, dirname, retained)
}

fn swapper_appdir(swapper: &BootstrapSwapper<'_>) -> PathBuf {
    swapper.appdir_path().to_path_buf()
}

fn retained_versions(store: &VersionStore, excluding: &str) -> Result<Vec<(String, VersionValue)>> {
    let (_, excl_version, _) = naming::split(excluding)?;
    let excl_version = VersionValue::parse(&excl_version)?;
    let mut out = Vec::new();
    for entry in store.list_all()? {
        if entry.dirname == excluding {
            continue;
        }
        if entry.version >= excl_version {
            out.push((entry.dirname, entry.version));
        }
    }
    Ok(out)
}

fn legacy_best_in_root(appdir: &Path, app_name: &str) -> Result<Option<String>> {
    let mut best: Option<(String, VersionValue)> = None;
    let entries = match fs::read_dir(appdir) {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let dirname = match entry.file_name().into_string() {
            Ok(s) => s,
            Err(_) => continue,
        };
        let (name, version_str, _) = match naming::split(&dirname) {
            Ok(parts) => parts,
            Err(_) => continue,
        };
        if name != app_name {
            continue;
        }
        let version = match VersionValue::parse(&version_str) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if best.as_ref().map(|(_, b)| &version > b).unwrap_or(true) {
            best = Some((dirname, version));
        }
    }
    Ok(best.map(|(d, _)| d))
}

/// Apply one deferred overwrite: truncate-then-write, so a replacement
/// file shorter than what it replaces doesn't leave trailing bytes of
/// the old content behind.
fn apply_overwrite(src: &Path, dst: &Path) -> Result<()> {
    let mut data = Vec::new();
    File::open(src)?.read_to_end(&mut data)?;
    let mut out = File::options().write(true).create(true).truncate(true).open(dst)?;
    out.write_all(&data)?;
    debug!(src = %src.display(), dst = %dst.display(), "applied deferred overwrite");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn apply_overwrite_truncates_shorter_replacement() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("new");
        let dst = dir.path().join("old");
        fs::write(&dst, b"a very long previous file contents").unwrap();
        fs::write(&src, b"short").unwrap();
        apply_overwrite(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"short");
    }

    #[test]
    fn plan_is_empty_for_clean_single_version_appdir() {
        let dir = tempdir().unwrap();
        let dirname = naming::join("app", "1.0.0", "linux-x86_64");
        let esky_files = dir.path().join(&dirname).join("esky-files");
        fs::create_dir_all(&esky_files).unwrap();
        fs::write(esky_files.join("bootstrap-manifest.txt"), "bin/app\n").unwrap();
        let engine = CleanupEngine::new(dir.path(), "app", 1);
        let plan = engine.plan(None).unwrap();
        assert!(plan.is_empty());
    }
}
