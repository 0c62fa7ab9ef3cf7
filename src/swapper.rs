//! BootstrapSwapper: the transactional heart of install/uninstall,
//! driven entirely through `FSTransaction` so a crash mid-swap always
//! leaves either the old or the new layout intact, never a mix.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(unix)]
use fs4::FileExt;

use crate::error::{RefitError, Result};
use crate::lock::AppdirLock;
use crate::manifest::{self, RelPath};
use crate::naming;
use crate::platform;
use crate::store::{VersionState, VersionStore};
use crate::transaction::FSTransaction;
use crate::version::VersionValue;

/// Stages a fetched version directory into the versions root
/// (`ABSENT -> STAGED`), then unpacks its bootstrap files into the appdir
/// and commits (`STAGED -> INSTALLED -> READY`).
pub struct BootstrapSwapper<'a> {
    appdir: &'a Path,
    store: &'a VersionStore,
}

impl<'a> BootstrapSwapper<'a> {
    pub fn new(appdir: &'a Path, store: &'a VersionStore) -> Self {
        BootstrapSwapper { appdir, store }
    }

    pub fn appdir_path(&self) -> &Path {
        self.appdir
    }

    /// Rename a staged version directory into the versions root, migrating
    /// a legacy root to its `appdata/` child in the process if needed. A
    /// no-op if the target already exists.
    pub fn stage(&self, staging_path: &Path, dirname: &str) -> Result<PathBuf> {
        let target = self.store.root_for_new_install()?.join(dirname);
        if target.exists() {
            return Ok(target);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging_path, &target)?;
        info!(version = dirname, "staged version directory");
        Ok(target)
    }

    /// Run the full install sequence for `dirname`: unpack bootstrap
    /// files into the appdir (`STAGED -> INSTALLED`), then commit
    /// (`INSTALLED -> READY`). Acquires the appdir lock for the whole
    /// sequence, acquiring the appdir lock up front and releasing it
    /// afterward regardless of outcome.
    pub fn install(&self, lock: &mut AppdirLock, dirname: &str) -> Result<()> {
        lock.acquire()?;
        let result = self.install_locked(dirname);
        lock.release()?;
        result
    }

    fn install_locked(&self, dirname: &str) -> Result<()> {
        let version_dir = self.store.version_path(dirname);
        let esky_files = version_dir.join("esky-files");
        let bootstrap_src = esky_files.join("bootstrap");
        let manifest_path = esky_files.join("bootstrap-manifest.txt");

        if !bootstrap_src.is_dir() {
            // Already fully unpacked by a previous (possibly interrupted
            // then resumed) run; nothing left to do.
            return Ok(());
        }

        let manifest_set = manifest::read_manifest(&manifest_path)?;
        let mut txn = FSTransaction::new(self.appdir);
        let overwrite_dir = esky_files.join("overwrite");
        let mut present: Vec<&RelPath> = Vec::new();

        for rel in &manifest_set {
            let src = rel.join_onto(&bootstrap_src);
            if !src.exists() {
                continue;
            }
            present.push(rel);
            let dst = rel.join_onto(self.appdir);
            if dst.exists() && platform::files_equal(&src, &dst)? {
                txn.record_remove(&src);
            } else if dst.exists() && platform::safe_to_overwrite(&dst) {
                let overwrite_dst = rel.join_onto(&overwrite_dir);
                txn.record_move(&src, &overwrite_dst);
            } else {
                txn.record_move(&src, &dst);
            }
        }

        // Every file's parent directory inside the staging tree is now
        // drained; record its removal too (innermost first), or the final
        // removal of `bootstrap/` itself fails with "directory not empty"
        // for any manifest with a nested path.
        for dir in removable_parent_dirs(&present, &bootstrap_src) {
            txn.record_remove(&dir);
        }

        // Mark the version installed by removing the now-drained
        // `bootstrap/` staging tree.
        txn.record_remove(&bootstrap_src);

        let sidecars = txn.commit()?;
        for sidecar in sidecars {
            warn!(path = %sidecar.display(), "leaving Windows sidecar for next cleanup pass");
        }
        info!(version = dirname, "installed version (now READY)");
        Ok(())
    }

    /// Disable a version: demote it from `READY` to `DISABLED` by
    /// removing the bootstrap paths it alone owns and renaming its
    /// manifest. `retained` is every other installed version whose
    /// parsed version is >= this one. Acquires the appdir lock.
    pub fn uninstall(
        &self,
        lock: &mut AppdirLock,
        dirname: &str,
        retained: &[(String, VersionValue)],
    ) -> Result<()> {
        lock.acquire()?;
        let result = self.uninstall_locked(dirname, retained);
        lock.release()?;
        result
    }

    fn uninstall_locked(&self, dirname: &str, retained: &[(String, VersionValue)]) -> Result<()> {
        let version_dir = self.store.version_path(dirname);
        let esky_files = version_dir.join("esky-files");
        let manifest_path = esky_files.join("bootstrap-manifest.txt");
        let manifest_old_path = esky_files.join("bootstrap-manifest-old.txt");

        if !manifest_path.is_file() {
            // Already disabled (or never installed) — idempotent no-op.
            return Ok(());
        }

        let own_manifest = manifest::read_manifest(&manifest_path)?;
        let mut retained_union: BTreeSet<RelPath> = BTreeSet::new();
        for (other_dirname, _) in retained {
            retained_union.extend(self.store.manifest_of(other_dirname)?);
        }
        let removable: Vec<&RelPath> = own_manifest.difference(&retained_union).collect();

        self.check_in_use(&version_dir)?;

        let mut txn = FSTransaction::new(self.appdir);
        for rel in &removable {
            let path = rel.join_onto(self.appdir);
            if path.exists() {
                txn.record_remove(&path);
            }
        }
        for dir in removable_parent_dirs(&removable, self.appdir) {
            txn.record_remove(&dir);
        }

        txn.commit()?;

        // The rename itself is the commit point that demotes the version
        // from READY. On Windows this rename is simultaneously the
        // liveness test; on POSIX the liveness check already happened
        // above via the flock.
        match fs::rename(&manifest_path, &manifest_old_path) {
            Ok(()) => {}
            Err(e) if platform::is_sharing_violation(&e) => {
                return Err(RefitError::VersionLocked(dirname.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(version = dirname, "uninstalled version (now DISABLED)");
        Ok(())
    }

    /// POSIX liveness check: try a non-blocking exclusive flock on the
    /// version's `lockfile.txt`. Failure means another process considers
    /// the version in use. On Windows this is a no-op; the manifest
    /// rename itself is the liveness test there.
    #[cfg(unix)]
    fn check_in_use(&self, version_dir: &Path) -> Result<()> {
        let lockfile_path = version_dir.join("esky-files").join("lockfile.txt");
        if let Some(parent) = lockfile_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lockfile_path)?;
        file.try_lock_exclusive().map_err(|_| {
            RefitError::VersionLocked(
                version_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        })?;
        // Release immediately: this is a liveness probe, not a held lock —
        // the flock is dropped with `file` at end of scope.
        let _ = file.unlock();
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_in_use(&self, _version_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Fully remove a `Disabled` version's private files from disk
    /// (`DISABLED -> PURGED`, performed lazily by `CleanupEngine`).
    pub fn purge(&self, dirname: &str) -> Result<()> {
        let version_dir = self.store.version_path(dirname);
        fs::remove_dir_all(&version_dir)?;
        info!(version = dirname, "purged version directory");
        Ok(())
    }

    /// Re-derive a version directory's durable state directly (used by
    /// `CleanupEngine` without going through a full `list_all` scan).
    pub fn state_of(&self, dirname: &str) -> Option<VersionState> {
        self.store
            .list_all()
            .ok()
            .and_then(|entries| entries.into_iter().find(|e| e.dirname == dirname))
            .map(|e| e.state)
    }
}

/// Every directory that, after removing `removable`, is or may become
/// empty and sits under a removed file's lineage — recorded innermost
/// first so `FSTransaction`'s ordered removal doesn't try to remove a
/// non-empty parent before its child. Used both for the appdir-side
/// directories an uninstall drains and the staging-side directories an
/// install drains out of `bootstrap/`.
fn removable_parent_dirs(removable: &[&RelPath], appdir: &Path) -> Vec<PathBuf> {
    let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
    for rel in removable {
        let mut cur = rel.as_path();
        while let Some(parent) = cur.parent() {
            if parent.as_os_str().is_empty() {
                break;
            }
            dirs.insert(appdir.join(parent));
            cur = parent;
        }
    }
    // Deepest paths first, so FSTransaction's in-order application never
    // hits a non-empty parent before its (about-to-be-removed) children.
    let mut out: Vec<PathBuf> = dirs.into_iter().collect();
    out.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup_staged(appdir: &Path, name: &str, version: &str) -> String {
        let dirname = naming::join(name, version, "linux-x86_64");
        let version_dir = appdir.join(&dirname);
        let bootstrap = version_dir.join("esky-files").join("bootstrap");
        fs::create_dir_all(bootstrap.join("lib")).unwrap();
        fs::write(bootstrap.join("lib").join("a.so"), b"libdata").unwrap();
        fs::write(bootstrap.join("app"), b"binary").unwrap();
        fs::write(
            version_dir.join("esky-files").join("bootstrap-manifest.txt"),
            "lib/a.so\napp\n",
        )
        .unwrap();
        dirname
    }

    #[test]
    fn fresh_install_unpacks_bootstrap_and_marks_ready() {
        let dir = tempdir().unwrap();
        let dirname = setup_staged(dir.path(), "app", "1.0.0");
        let store = VersionStore::new(dir.path(), "app");
        let swapper = BootstrapSwapper::new(dir.path(), &store);
        let mut lock = AppdirLock::with_timeout(dir.path(), Duration::from_secs(3600));

        swapper.install(&mut lock, &dirname).unwrap();

        assert_eq!(fs::read(dir.path().join("lib/a.so")).unwrap(), b"libdata");
        assert_eq!(fs::read(dir.path().join("app")).unwrap(), b"binary");
        assert!(!dir
            .path()
            .join(&dirname)
            .join("esky-files")
            .join("bootstrap")
            .exists());
        let best = store.get_best_version(false).unwrap().unwrap();
        assert_eq!(best.version.as_str(), "1.0.0");
    }

    #[test]
    fn upgrade_keeps_files_still_referenced_by_retained_manifest() {
        let dir = tempdir().unwrap();
        let d1 = setup_staged(dir.path(), "app", "1.0.0");
        let store = VersionStore::new(dir.path(), "app");
        let swapper = BootstrapSwapper::new(dir.path(), &store);
        let mut lock = AppdirLock::with_timeout(dir.path(), Duration::from_secs(3600));
        swapper.install(&mut lock, &d1).unwrap();

        // Stage 1.0.1, which adds lib/b.so and replaces app.
        let d2 = naming::join("app", "1.0.1", "linux-x86_64");
        let v2_dir = dir.path().join(&d2);
        let bootstrap2 = v2_dir.join("esky-files").join("bootstrap");
        fs::create_dir_all(bootstrap2.join("lib")).unwrap();
        fs::write(bootstrap2.join("lib").join("b.so"), b"newlib").unwrap();
        fs::write(bootstrap2.join("app"), b"binary-v2").unwrap();
        fs::write(
            v2_dir.join("esky-files").join("bootstrap-manifest.txt"),
            "lib/a.so\nlib/b.so\napp\n",
        )
        .unwrap();
        swapper.install(&mut lock, &d2).unwrap();

        assert!(dir.path().join("lib/a.so").exists());
        assert!(dir.path().join("lib/b.so").exists());
        assert_eq!(fs::read(dir.path().join("app")).unwrap(), b"binary-v2");

        // Uninstalling 1.0.0 while 1.0.0 is "active" must not remove
        // files 1.0.1 still needs; here we simulate "active" by simply
        // retaining 1.0.1 in the retained set (the real liveness check
        // for "in use" is the lockfile/manifest-rename, exercised
        // separately).
        let retained = vec![(d2.clone(), VersionValue::parse("1.0.1").unwrap())];
        swapper.uninstall(&mut lock, &d1, &retained).unwrap();
        assert!(dir.path().join("lib/a.so").exists());
        assert!(dir.path().join("lib/b.so").exists());
    }

    #[cfg(unix)]
    #[test]
    fn uninstall_fails_when_lockfile_held() {
        let dir = tempdir().unwrap();
        let dirname = setup_staged(dir.path(), "app", "1.0.0");
        let store = VersionStore::new(dir.path(), "app");
        let swapper = BootstrapSwapper::new(dir.path(), &store);
        let mut lock = AppdirLock::with_timeout(dir.path(), Duration::from_secs(3600));
        swapper.install(&mut lock, &dirname).unwrap();

        let lockfile_path = dir
            .path()
            .join(&dirname)
            .join("esky-files")
            .join("lockfile.txt");
        let held = fs::File::create(&lockfile_path).unwrap();
        held.lock_exclusive().unwrap();

        let err = swapper.uninstall(&mut lock, &dirname, &[]).unwrap_err();
        assert!(matches!(err, RefitError::VersionLocked(_)));
    }
}
