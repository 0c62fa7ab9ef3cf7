//! FSTransaction: an ordered, revertible log of filesystem moves and
//! removals, committed or aborted as a single unit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{RefitError, Result};
use crate::platform;

/// One recorded filesystem operation.
#[derive(Debug, Clone)]
enum Op {
    Move { src: PathBuf, dst: PathBuf },
    Remove { path: PathBuf },
}

/// What actually happened when an [`Op`] was applied, needed to reverse it.
#[derive(Debug, Clone)]
pub(crate) enum Done {
    /// A plain rename from `src` to `dst` (POSIX atomic replace, or a
    /// Windows rename onto a destination that didn't previously exist).
    Moved { src: PathBuf, dst: PathBuf },
    /// A Windows sidecar move: `dst` was renamed to `sidecar` first, then
    /// `src` was renamed into `dst`. Reversing restores `sidecar` back
    /// onto `dst` after removing the newly-placed file.
    MovedWithSidecar {
        src: PathBuf,
        dst: PathBuf,
        sidecar: PathBuf,
    },
    /// A path was removed; `backup` holds where its content was stashed
    /// so abort can put it back.
    Removed { path: PathBuf, backup: PathBuf, backup_dir: tempfile::TempDir },
}

/// Transaction state: `Open` while recording/applying, `Committed`/
/// `Aborted` once terminal — the transaction object does not accept
/// further operations after either.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum State {
    Open,
    Committed,
    Aborted,
}

/// An ordered, revertible sequence of `move`/`remove` filesystem
/// operations, rooted at an appdir.
pub struct FSTransaction {
    root: PathBuf,
    ops: Vec<Op>,
    done: Vec<Done>,
    state: State,
    /// Sidecars (`<name>.old`) left behind by a committed Windows swap,
    /// to be swept up by the next `CleanupEngine` run.
    deferred_sidecars: Vec<PathBuf>,
}

impl FSTransaction {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FSTransaction {
            root: root.into(),
            ops: Vec::new(),
            done: Vec::new(),
            state: State::Open,
            deferred_sidecars: Vec::new(),
        }
    }

    /// Record a move. Not applied until `commit()`.
    pub fn record_move(&mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) {
        assert_eq!(self.state, State::Open, "transaction is terminal");
        self.ops.push(Op::Move {
            src: src.into(),
            dst: dst.into(),
        });
    }

    /// Record a removal. Not applied until `commit()`.
    pub fn record_remove(&mut self, path: impl Into<PathBuf>) {
        assert_eq!(self.state, State::Open, "transaction is terminal");
        self.ops.push(Op::Remove { path: path.into() });
    }

    /// Number of operations recorded so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sidecar files left behind by a committed transaction, to be
    /// deleted by the next cleanup pass.
    pub fn deferred_sidecars(&self) -> &[PathBuf] {
        &self.deferred_sidecars
    }

    /// Apply every recorded operation in order. On the first failure, all
    /// completed operations are reversed (LIFO) and the original error is
    /// returned. Terminal either way.
    pub fn commit(mut self) -> Result<Vec<PathBuf>> {
        for op in self.ops.clone() {
            if let Err(e) = self.apply(&op) {
                warn!(root = %self.root.display(), "transaction op failed, aborting");
                self.unwind();
                self.state = State::Aborted;
                return Err(e);
            }
        }
        self.state = State::Committed;
        debug!(root = %self.root.display(), ops = self.done.len(), "transaction committed");
        Ok(std::mem::take(&mut self.deferred_sidecars))
    }

    /// Abort, reversing whatever has been applied so far. A transaction
    /// that was only ever recorded into (never applied) aborts as a no-op.
    pub fn abort(mut self) {
        self.unwind();
        self.state = State::Aborted;
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Move { src, dst } => {
                let done = platform::replace_rename(src, dst)?;
                self.done.push(done);
                Ok(())
            }
            Op::Remove { path } => {
                let done = remove_with_backup(path)?;
                self.done.push(done);
                Ok(())
            }
        }
    }

    fn unwind(&mut self) {
        while let Some(done) = self.done.pop() {
            if let Err(e) = reverse(done) {
                warn!(error = %e, "failed to reverse transaction step during abort");
            }
        }
    }
}

impl Drop for FSTransaction {
    fn drop(&mut self) {
        if self.state == State::Open && !self.done.is_empty() {
            // Defensive: a transaction dropped without commit/abort after
            // partially applying should still unwind rather than leave
            // half-applied state on disk.
            self.unwind();
        }
    }
}

fn remove_with_backup(path: &Path) -> Result<Done> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        // Removing a directory is only permitted when it's empty.
        let mut entries = fs::read_dir(path)?;
        if entries.next().is_some() {
            return Err(RefitError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("directory not empty: {}", path.display()),
            )));
        }
    }
    let backup_dir = tempfile::Builder::new()
        .prefix("refit-txn-")
        .tempdir_in(path.parent().unwrap_or(Path::new(".")))?;
    let backup = backup_dir.path().join("backup");
    fs::rename(path, &backup)?;
    Ok(Done::Removed {
        path: path.to_path_buf(),
        backup,
        backup_dir,
    })
}

fn reverse(done: Done) -> Result<()> {
    match done {
        Done::Moved { src, dst } => {
            fs::rename(&dst, &src)?;
            Ok(())
        }
        Done::MovedWithSidecar { src, dst, sidecar } => {
            // Undo: remove the file we moved into place, put the sidecar
            // back, and put the original src back where it was.
            fs::rename(&dst, &src)?;
            fs::rename(&sidecar, &dst)?;
            Ok(())
        }
        Done::Removed {
            path, backup, ..
        } => {
            fs::rename(&backup, &path)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn commit_applies_moves_and_removes_in_order() {
        let root = tempdir().unwrap();
        let src = root.path().join("src.txt");
        let dst = root.path().join("dst.txt");
        fs::write(&src, b"hello").unwrap();
        let empty_dir = root.path().join("empty");
        fs::create_dir(&empty_dir).unwrap();

        let mut txn = FSTransaction::new(root.path());
        txn.record_move(&src, &dst);
        txn.record_remove(&empty_dir);
        txn.commit().unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
        assert!(!empty_dir.exists());
    }

    #[test]
    fn abort_reverses_completed_steps() {
        let root = tempdir().unwrap();
        let src = root.path().join("src.txt");
        let dst = root.path().join("dst.txt");
        fs::write(&src, b"hello").unwrap();

        let mut txn = FSTransaction::new(root.path());
        txn.record_move(&src, &dst);
        txn.abort();

        // Nothing was ever applied since we called abort() before commit();
        // src should be untouched.
        assert!(src.exists());
        assert!(!dst.exists());
    }

    #[test]
    fn failure_mid_commit_rolls_back_earlier_steps() {
        let root = tempdir().unwrap();
        let src1 = root.path().join("src1.txt");
        let dst1 = root.path().join("dst1.txt");
        fs::write(&src1, b"one").unwrap();
        let nonexistent_src = root.path().join("does-not-exist.txt");
        let dst2 = root.path().join("dst2.txt");

        let mut txn = FSTransaction::new(root.path());
        txn.record_move(&src1, &dst1);
        txn.record_move(&nonexistent_src, &dst2);
        let err = txn.commit();
        assert!(err.is_err());
        // First move should have been reversed.
        assert!(src1.exists());
        assert!(!dst1.exists());
    }

    #[test]
    fn remove_nonempty_dir_fails() {
        let root = tempdir().unwrap();
        let d = root.path().join("d");
        fs::create_dir(&d).unwrap();
        fs::write(d.join("f"), b"x").unwrap();

        let mut txn = FSTransaction::new(root.path());
        txn.record_remove(&d);
        assert!(txn.commit().is_err());
        assert!(d.exists());
    }
}
