//! A coarse-grained, reentrant, staleness-breaking exclusive lock on an
//! appdir.
//!
//! The lock is a directory, `<appdir>/locked/`, whose mere existence
//! (created via an atomic `mkdir`) represents exclusive ownership, and
//! whose single member file (named after host/pid/thread) identifies
//! who holds it. There is no blocking variant — callers that want to
//! wait must retry.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{RefitError, Result};

/// Default staleness timeout.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

const MAX_BREAK_RETRIES: u32 = 5;

/// A held (or not-yet-acquired) lock on an appdir.
pub struct AppdirLock {
    appdir: PathBuf,
    timeout: Duration,
    marker_name: String,
    count: u32,
}

impl AppdirLock {
    /// Build a lock handle for `appdir`. Does not acquire anything yet.
    pub fn new(appdir: impl Into<PathBuf>) -> Self {
        Self::with_timeout(appdir, LOCK_TIMEOUT)
    }

    pub fn with_timeout(appdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        AppdirLock {
            appdir: appdir.into(),
            timeout,
            marker_name: marker_id(),
            count: 0,
        }
    }

    fn lockdir(&self) -> PathBuf {
        self.appdir.join("locked")
    }

    fn marker_path(&self) -> PathBuf {
        self.lockdir().join(&self.marker_name)
    }

    /// True if this handle currently holds the lock (reentrant count > 0).
    pub fn is_held(&self) -> bool {
        self.count > 0
    }

    /// Acquire the lock, breaking a stale one if found. Never blocks.
    pub fn acquire(&mut self) -> Result<()> {
        self.acquire_inner(0)
    }

    fn acquire_inner(&mut self, retries: u32) -> Result<()> {
        if retries > MAX_BREAK_RETRIES {
            return Err(RefitError::LockBusy(self.appdir.clone()));
        }

        // Already own the lock? Bump the reentrancy counter and refresh
        // the marker's mtime so a concurrent staleness check doesn't
        // consider us dead.
        let marker = self.marker_path();
        if marker.exists() {
            touch(&marker)?;
            self.count += 1;
            debug!(appdir = %self.appdir.display(), count = self.count, "appdir lock: reentered");
            return Ok(());
        }

        let lockdir = self.lockdir();
        match fs::create_dir(&lockdir) {
            Ok(()) => {
                File::create(&marker)?;
                self.count = 1;
                debug!(appdir = %self.appdir.display(), "appdir lock: acquired");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.break_if_stale(&lockdir)? {
                    self.acquire_inner(retries + 1)
                } else {
                    Err(RefitError::LockBusy(self.appdir.clone()))
                }
            }
            Err(e) => Err(RefitError::Io(e)),
        }
    }

    /// Returns `Ok(true)` if a stale lock was found and removed (caller
    /// should retry acquisition), `Ok(false)` if the lock is live.
    fn break_if_stale(&self, lockdir: &Path) -> Result<bool> {
        let newest = newest_mtime(lockdir)?;
        let newest = match newest {
            Some(t) => t,
            // The directory vanished between our create_dir failing and
            // us getting here (another process released it) — treat as
            // immediately retryable.
            None => return Ok(true),
        };
        let age = SystemTime::now()
            .duration_since(newest)
            .unwrap_or(Duration::ZERO);
        if age >= self.timeout {
            warn!(
                appdir = %self.appdir.display(),
                age_secs = age.as_secs(),
                "appdir lock: breaking stale lock"
            );
            match fs::remove_dir_all(lockdir) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(RefitError::Io(e)),
            }
        } else {
            Ok(false)
        }
    }

    /// Release the lock. Decrements the reentrancy counter; on reaching
    /// zero, removes our marker and (best-effort) the lock directory.
    pub fn release(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.count -= 1;
        if self.count == 0 {
            let marker = self.marker_path();
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RefitError::Io(e)),
            }
            // Best-effort: ignore failure if other holders' markers remain.
            let _ = fs::remove_dir(self.lockdir());
            debug!(appdir = %self.appdir.display(), "appdir lock: released");
        }
        Ok(())
    }
}

impl Drop for AppdirLock {
    fn drop(&mut self) {
        if self.count > 0 {
            let _ = self.release();
        }
    }
}

fn touch(path: &Path) -> Result<()> {
    let now = fs::FileTimes::new().set_modified(SystemTime::now());
    let f = File::options().write(true).open(path)?;
    f.set_times(now)?;
    Ok(())
}

fn newest_mtime(dir: &Path) -> Result<Option<SystemTime>> {
    let dir_meta = match fs::metadata(dir) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RefitError::Io(e)),
    };
    let mut newest = dir_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RefitError::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        if let Ok(meta) = entry.metadata() {
            if let Ok(mtime) = meta.modified() {
                if mtime > newest {
                    newest = mtime;
                }
            }
        }
    }
    Ok(Some(newest))
}

/// Build the `<hostname>-<pid>-<threadid>` marker name for this thread.
fn marker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let pid = std::process::id();
    let tid = thread_id_number();
    format!("{host}-{pid}-{tid}")
}

/// Extract a stable-ish numeric identifier out of `ThreadId`'s `Debug`
/// representation (`"ThreadId(N)"`). `std::thread::ThreadId` doesn't
/// expose its integer directly, so we scrape it instead of reaching for
/// unstable APIs.
fn thread_id_number() -> String {
    let debug = format!("{:?}", std::thread::current().id());
    debug.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release() {
        let dir = tempdir().unwrap();
        let mut lock = AppdirLock::new(dir.path());
        lock.acquire().unwrap();
        assert!(dir.path().join("locked").is_dir());
        lock.release().unwrap();
        assert!(!dir.path().join("locked").exists());
    }

    #[test]
    fn reentrant_acquire() {
        let dir = tempdir().unwrap();
        let mut lock = AppdirLock::new(dir.path());
        lock.acquire().unwrap();
        lock.acquire().unwrap();
        lock.release().unwrap();
        // Still held after one release (count was 2).
        assert!(dir.path().join("locked").is_dir());
        lock.release().unwrap();
        assert!(!dir.path().join("locked").exists());
    }

    #[test]
    fn busy_lock_from_another_marker_is_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("locked")).unwrap();
        File::create(dir.path().join("locked").join("someone-else-0")).unwrap();
        let mut lock = AppdirLock::new(dir.path());
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, RefitError::LockBusy(_)));
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempdir().unwrap();
        let lockdir = dir.path().join("locked");
        fs::create_dir(&lockdir).unwrap();
        let marker = lockdir.join("someone-else-0");
        File::create(&marker).unwrap();
        let old = SystemTime::now() - Duration::from_secs(7200);
        age(&marker, old);
        age(&lockdir, old);

        let mut lock = AppdirLock::with_timeout(dir.path(), Duration::from_secs(3600));
        lock.acquire().unwrap();
        assert!(lockdir.join(&lock.marker_name).is_file());
    }

    fn age(path: &Path, when: SystemTime) {
        let times = fs::FileTimes::new().set_modified(when);
        File::open(path).unwrap().set_times(times).unwrap();
    }
}
