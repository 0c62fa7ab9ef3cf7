//! Updater: the façade an embedder calls to find, fetch, install, and
//! uninstall versions, and to run periodic cleanup.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cleanup::{CleanupEngine, CleanupReport};
use crate::config::Config;
use crate::error::{RefitError, Result};
use crate::finder::{ProgressFn, VersionFinder};
use crate::lock::AppdirLock;
use crate::naming;
use crate::proxy::PrivilegedProxy;
use crate::store::VersionStore;
use crate::swapper::BootstrapSwapper;
use crate::version::VersionValue;

/// An installed application rooted at an appdir. Carries the
/// name, platform token, and — when constructed from the currently
/// running executable — the `ActiveVersion` whose files are protected
/// from deletion while it's in use.
#[derive(Debug, Clone)]
pub struct AppInstallation {
    pub appdir: PathBuf,
    pub name: String,
    pub platform: String,
    pub active_version: Option<String>,
}

impl AppInstallation {
    /// Root at an arbitrary appdir path, with no active version. This is
    /// what the demo CLI and every test use.
    pub fn from_appdir(appdir: impl Into<PathBuf>, name: impl Into<String>, platform: impl Into<String>) -> Self {
        AppInstallation {
            appdir: appdir.into(),
            name: name.into(),
            platform: platform.into(),
            active_version: None,
        }
    }

    /// Root at the currently-executing binary's containing version
    /// directory, deriving `active_version` from the enclosing
    /// `<name>-<version>-<platform>` directory name.
    pub fn from_running_exe(platform: impl Into<String>) -> Result<Self> {
        let exe = std::env::current_exe().map_err(RefitError::Io)?;
        let version_dir = exe
            .parent()
            .and_then(|p| p.parent()) // .../esky-files/.. is the version dir's private tree
            .ok_or_else(|| RefitError::Broken(exe.clone()))?;
        let dirname = version_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RefitError::Broken(exe.clone()))?;
        let (name, _version, _platform) = naming::split(dirname)?;
        let versions_root = version_dir
            .parent()
            .ok_or_else(|| RefitError::Broken(exe.clone()))?;
        let appdir = versions_root
            .file_name()
            .map(|n| n == "appdata")
            .unwrap_or(false)
            .then(|| versions_root.parent().map(|p| p.to_path_buf()))
            .flatten()
            .unwrap_or_else(|| versions_root.to_path_buf());
        Ok(AppInstallation {
            appdir,
            name,
            platform: platform.into(),
            active_version: Some(dirname.to_string()),
        })
    }
}

/// The update lifecycle façade. Owns the appdir lock, consults the
/// `VersionStore`, and drives `BootstrapSwapper`/`CleanupEngine` for
/// every mutating operation.
pub struct Updater {
    install: AppInstallation,
    keep_versions: usize,
    lock: AppdirLock,
    finder: Option<Box<dyn VersionFinder>>,
    proxy: Option<Box<dyn PrivilegedProxy>>,
    current_version: Option<String>,
}

impl Updater {
    pub fn new(appdir: impl Into<PathBuf>, app_name: impl Into<String>, platform: impl Into<String>) -> Self {
        let install = AppInstallation::from_appdir(appdir, app_name, platform);
        let lock = AppdirLock::new(install.appdir.clone());
        Updater {
            install,
            keep_versions: 2,
            lock,
            finder: None,
            proxy: None,
            current_version: None,
        }
    }

    pub fn with_finder(mut self, finder: Box<dyn VersionFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn with_proxy(mut self, proxy: Box<dyn PrivilegedProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_keep_versions(mut self, keep: usize) -> Self {
        self.keep_versions = keep;
        self
    }

    pub fn with_active_version(mut self, active: Option<String>) -> Self {
        self.install.active_version = active;
        self
    }

    /// Build an `Updater` from a loaded [`Config`].
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let appdir = cfg.resolved_appdir();
        let mut updater = Updater::new(&appdir, &cfg.app_name, &cfg.platform)
            .with_keep_versions(cfg.keep_versions);
        updater.lock = AppdirLock::with_timeout(
            appdir,
            std::time::Duration::from_secs(cfg.lock_timeout_secs),
        );
        if let Some(finder) = cfg.finder.build()? {
            updater = updater.with_finder(finder);
        }
        Ok(updater)
    }

    pub fn appdir(&self) -> &Path {
        &self.install.appdir
    }

    pub fn active_version(&self) -> Option<&str> {
        self.install.active_version.as_deref()
    }

    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    fn store(&self) -> VersionStore {
        VersionStore::new(&self.install.appdir, &self.install.name)
    }

    // --- privileged surface (mirrors every operation that needs elevation) ---

    pub fn lock(&mut self) -> Result<()> {
        if let Some(proxy) = &mut self.proxy {
            return proxy.lock();
        }
        self.lock.acquire()
    }

    pub fn unlock(&mut self) -> Result<()> {
        if let Some(proxy) = &mut self.proxy {
            return proxy.unlock();
        }
        self.lock.release()
    }

    pub fn has_root(&self) -> bool {
        self.proxy.as_ref().map(|p| p.has_root()).unwrap_or(false)
    }

    /// Refresh `current_version` from the `VersionStore`.
    pub fn reinitialize(&mut self) -> Result<()> {
        let store = self.store();
        self.current_version = store.get_best_version(false)?.map(|v| v.dirname);
        Ok(())
    }

    /// Highest version strictly greater than the current one, or `None`.
    pub fn find_update(&self) -> Result<Option<VersionValue>> {
        let finder = self.finder.as_deref().ok_or(RefitError::NoVersionFinder)?;
        let current = self.current_installed_version()?;
        let mut versions = finder.find_versions(&self.install.name)?;
        versions.retain(|v| match &current {
            Some(cur) => v > cur,
            None => true,
        });
        versions.sort();
        Ok(versions.into_iter().last())
    }

    fn current_installed_version(&self) -> Result<Option<VersionValue>> {
        match &self.current_version {
            Some(dirname) => {
                let (_, version_str, _) = naming::split(dirname)?;
                Ok(Some(VersionValue::parse(&version_str)?))
            }
            None => Ok(None),
        }
    }

    /// Fetch `v` via the attached `VersionFinder`, then adjust
    /// ownership/permissions of the staging path to match the currently
    /// installed version.
    pub fn fetch_version(&self, v: &VersionValue, progress: &mut ProgressFn<'_>) -> Result<PathBuf> {
        let finder = self.finder.as_deref().ok_or(RefitError::NoVersionFinder)?;
        let staged = finder.fetch_version(&self.install.name, v, progress)?;
        if let Some(current_dirname) = &self.current_version {
            let reference = self.store().version_path(current_dirname);
            if reference.exists() {
                crate::platform::copy_ownership_info(&reference, &staged)?;
            }
        }
        Ok(staged)
    }

    /// Fetch (if not already staged) and install version `version`.
    pub fn install_version(&mut self, version: &str) -> Result<()> {
        if let Some(proxy) = &mut self.proxy {
            return proxy.install_version(&self.install.name, version);
        }
        let v = VersionValue::parse(version)?;
        let store = self.store();
        let dirname = naming::join(&self.install.name, version, &self.install.platform);

        if store.version_path(&dirname).join("esky-files").join("bootstrap-manifest.txt").exists()
            || store.version_path(&dirname).join("esky-files").join("bootstrap").exists()
        {
            // Already staged (possibly by a previous call to fetch_version).
        } else if let Some(finder) = &self.finder {
            let staged = finder.fetch_version(&self.install.name, &v, &mut |_, _| true)?;
            let swapper = BootstrapSwapper::new(&self.install.appdir, &store);
            swapper.stage(&staged, &dirname)?;
        } else {
            return Err(RefitError::NoVersionFinder);
        }

        let swapper = BootstrapSwapper::new(&self.install.appdir, &store);
        swapper.install(&mut self.lock, &dirname)?;
        self.reinitialize()?;
        Ok(())
    }

    /// Uninstall version `version` (demote `READY -> DISABLED`; actual
    /// file purge happens lazily in `CleanupEngine`).
    pub fn uninstall_version(&mut self, version: &str) -> Result<()> {
        if let Some(proxy) = &mut self.proxy {
            return proxy.uninstall_version(&self.install.name, version);
        }
        let dirname = naming::join(&self.install.name, version, &self.install.platform);
        if self.install.active_version.as_deref() == Some(dirname.as_str()) {
            return Err(RefitError::VersionLocked(dirname));
        }
        let store = self.store();
        let v = VersionValue::parse(version)?;
        let retained: Vec<(String, VersionValue)> = store
            .list_all()?
            .into_iter()
            .filter(|e| e.dirname != dirname && e.version >= v)
            .map(|e| (e.dirname, e.version))
            .collect();
        let swapper = BootstrapSwapper::new(&self.install.appdir, &store);
        swapper.uninstall(&mut self.lock, &dirname, &retained)?;
        Ok(())
    }

    pub fn needs_cleanup(&self) -> Result<bool> {
        let engine = self.cleanup_engine();
        engine.needs_cleanup(self.install.active_version.as_deref())
    }

    pub fn cleanup(&mut self) -> Result<CleanupReport> {
        if let Some(proxy) = &mut self.proxy {
            let fully_cleaned = proxy.cleanup()?;
            return Ok(CleanupReport {
                attempted: 0,
                failed: if fully_cleaned {
                    Vec::new()
                } else {
                    vec![("proxy".to_string(), "remote cleanup did not fully succeed".to_string())]
                },
            });
        }
        let engine = self.cleanup_engine();
        let report = engine.run(&mut self.lock, self.install.active_version.as_deref())?;
        self.reinitialize()?;
        Ok(report)
    }

    fn cleanup_engine(&self) -> CleanupEngine<'_> {
        let engine = CleanupEngine::new(&self.install.appdir, &self.install.name, self.keep_versions);
        match &self.finder {
            Some(f) => engine.with_finder(f.as_ref()),
            None => engine,
        }
    }

    /// Registers a process-exit hook that respawns this binary with
    /// `--refit-cleanup-at-exit` and a serialized control record. The
    /// child waits ~1s for this process to exit, then runs cleanup and
    /// exits 0/1.
    pub fn cleanup_at_exit(&mut self) -> Result<()> {
        if let Some(proxy) = &mut self.proxy {
            return proxy.cleanup_at_exit();
        }
        // `libc::atexit`-style hooks aren't exposed portably from safe
        // std; the demo CLI instead calls this just before a normal
        // `main` return (see `cli.rs`), which is the common real-world
        // trigger point for "clean up on my way out". The respawned
        // child waits ~1s for this pid to exit (see `main.rs`'s
        // `--refit-cleanup-at-exit` handler) before running cleanup.
        let exe = std::env::current_exe().map_err(RefitError::Io)?;
        let pid = std::process::id();
        std::process::Command::new(&exe)
            .arg("--refit-cleanup-at-exit")
            .arg("--refit-parent-pid")
            .arg(pid.to_string())
            .arg("--refit-appdir")
            .arg(&self.install.appdir)
            .arg("--refit-app-name")
            .arg(&self.install.name)
            .arg("--refit-platform")
            .arg(&self.install.platform)
            .spawn()
            .map_err(RefitError::Io)?;
        Ok(())
    }

    /// Convenience sequence: find -> fetch -> install -> uninstall(current)
    /// -> reinitialize -> cleanup. On `PermissionDenied` at any step,
    /// escalates through the attached `PrivilegedProxy` and retries that
    /// sub-operation exactly once.
    pub fn auto_update(&mut self, mut progress: impl FnMut(&str) + Send) -> Result<Option<VersionValue>> {
        let target = match self.find_update()? {
            Some(v) => v,
            None => return Ok(None),
        };
        progress(&format!("found update: {target}"));

        let previous = self.current_version.clone();

        self.retry_on_permission_denied(|u| {
            let mut noop = |_n: u64, _t: Option<u64>| true;
            u.fetch_version(&target, &mut noop).map(|_| ())
        })?;
        progress("fetched");

        self.retry_on_permission_denied(|u| u.install_version(target.as_str()))?;
        progress("installed");

        if let Some(prev_dirname) = previous {
            let (_, prev_version, _) = naming::split(&prev_dirname)?;
            match self.retry_on_permission_denied(|u| u.uninstall_version(&prev_version)) {
                Ok(()) => {}
                Err(RefitError::VersionLocked(_)) => {
                    // Previous version is active; leave it for the next
                    // cleanup pass.
                }
                Err(e) => return Err(e),
            }
        }
        progress("uninstalled previous");

        self.reinitialize()?;
        let _ = self.cleanup()?;
        progress("cleaned up");

        Ok(Some(target))
    }

    fn retry_on_permission_denied(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<()>,
    ) -> Result<()> {
        match op(self) {
            Err(e) if e.is_permission_denied() && self.proxy.is_some() => {
                warn!("permission denied, retrying via privileged proxy");
                op(self)
            }
            other => other,
        }
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        if self.lock.is_held() {
            let _ = self.lock.release();
        }
    }
}
