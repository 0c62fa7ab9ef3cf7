//! Platform-conditional primitives: atomic replace-rename, Windows
//! sharing-violation detection, "safe to overwrite" heuristic, and
//! ownership/permission copying.
//!
//! Uses the same temp-then-rename pattern and raw-OS-error matching
//! that cross-platform atomic-swap code typically relies on, generalized
//! here to also detect a Windows sharing violation on the destination.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::transaction::Done;

/// Perform `src -> dst`, replacing any existing file at `dst`.
///
/// On POSIX, `rename(2)` already atomically replaces an existing
/// destination, so this is a single rename. On Windows, a rename onto an
/// existing file fails; the existing destination is first renamed aside
/// to a `<name>.old` sidecar, then `src` is renamed into place. The
/// sidecar is left for the next `CleanupEngine` pass to remove on commit,
/// or restored immediately on abort.
pub(crate) fn replace_rename(src: &Path, dst: &Path) -> Result<Done> {
    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    if cfg!(windows) && dst.exists() {
        let sidecar = sidecar_path(dst);
        if sidecar.exists() {
            fs::remove_file(&sidecar).or_else(|_| fs::remove_dir_all(&sidecar))?;
        }
        fs::rename(dst, &sidecar)?;
        match fs::rename(src, dst) {
            Ok(()) => Ok(Done::MovedWithSidecar {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                sidecar,
            }),
            Err(e) => {
                // Roll the sidecar straight back before surfacing the error.
                let _ = fs::rename(&sidecar, dst);
                Err(e.into())
            }
        }
    } else {
        fs::rename(src, dst)?;
        Ok(Done::Moved {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        })
    }
}

fn sidecar_path(dst: &Path) -> PathBuf {
    let mut name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".old");
    dst.with_file_name(name)
}

/// Detect a Windows "sharing violation" rename failure (raw OS error 32,
/// `ERROR_SHARING_VIOLATION`), used by `BootstrapSwapper::uninstall` as
/// the in-use test for a version's `bootstrap-manifest.txt` rename.
pub fn is_sharing_violation(err: &std::io::Error) -> bool {
    #[cfg(windows)]
    {
        err.raw_os_error() == Some(32)
    }
    #[cfg(not(windows))]
    {
        let _ = err;
        false
    }
}

/// True if a cross-device rename failure (`EXDEV`) is what happened.
pub fn is_cross_device(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        use std::io::ErrorKind;
        err.kind() == ErrorKind::CrossesDevices || err.raw_os_error() == Some(18)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Whether `dst` is safe to overwrite in place with `src`'s content
/// without going through the deferred-overwrite queue.
///
/// On non-Windows platforms renames already replace atomically regardless
/// of whether the target is in use, so this question never arises there —
/// always "unsafe" in the sense that the caller should just move it
/// directly rather than defer (the whole deferred-overwrite mechanism
/// only exists to work around Windows's in-use file semantics).
///
/// On Windows: a destination is judged safe to overwrite directly if it
/// is not currently opened exclusively by a running process. We probe
/// this non-destructively by attempting to open it with the same sharing
/// flags a rename would need; if that open fails, the file is busy and
/// should go through the overwrite queue instead.
pub fn safe_to_overwrite(dst: &Path) -> bool {
    #[cfg(windows)]
    {
        match fs::OpenOptions::new().write(true).open(dst) {
            Ok(_) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(windows))]
    {
        let _ = dst;
        false
    }
}

/// Compare two files byte-for-byte, chunk at a time. Used to decide
/// whether a bootstrap file already matches what's in the appdir — if so,
/// installing it is a no-op beyond recording the removal of the staged
/// copy.
pub fn files_equal(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::metadata(a)?;
    let meta_b = match fs::metadata(b) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    use std::io::Read;
    let mut fa = fs::File::open(a)?;
    let mut fb = fs::File::open(b)?;
    let mut buf_a = [0u8; 64 * 1024];
    let mut buf_b = [0u8; 64 * 1024];
    loop {
        let na = fa.read(&mut buf_a)?;
        let nb = fb.read(&mut buf_b)?;
        if na != nb {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
        if buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
    }
}

/// Copy ownership/permission info from `reference` onto `target`
/// (recursively, best-effort). Used after fetching a new version's
/// staging directory, so its ownership/permissions match the currently
/// installed version rather than whatever the download left behind.
pub fn copy_ownership_info(reference: &Path, target: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::metadata(reference)?;
        let perms = fs::Permissions::from_mode(meta.permissions().mode());
        apply_perms_recursive(target, &perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (reference, target);
    }
    Ok(())
}

#[cfg(unix)]
fn apply_perms_recursive(path: &Path, perms: &fs::Permissions) -> Result<()> {
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        let _ = fs::set_permissions(entry.path(), perms.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn files_equal_detects_identical_and_different() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, b"hello world").unwrap();
        fs::write(&b, b"hello world").unwrap();
        fs::write(&c, b"goodbye").unwrap();
        assert!(files_equal(&a, &b).unwrap());
        assert!(!files_equal(&a, &c).unwrap());
    }

    #[test]
    fn replace_rename_moves_into_place() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"new").unwrap();
        let done = replace_rename(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"new");
        assert!(matches!(done, Done::Moved { .. }));
    }

    #[cfg(windows)]
    #[test]
    fn sharing_violation_detected_when_destination_is_open_elsewhere() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("locked.exe");
        fs::write(&dst, b"binary").unwrap();
        let _keep_open = fs::OpenOptions::new().read(true).open(&dst).unwrap();
        let src = dir.path().join("new.exe");
        fs::write(&src, b"newer").unwrap();
        let err = fs::rename(&src, &dst).unwrap_err();
        assert!(is_sharing_violation(&err));
    }
}
