//! Error taxonomy for the update engine.
//!
//! Library code returns `RefitError`; the CLI layer converts these into
//! `anyhow::Error` with added context, keeping a line between "the thing
//! that can fail precisely" and "the thing a human reads".

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the update engine.
#[derive(Debug, Error)]
pub enum RefitError {
    /// The appdir has no usable installed version and cannot be repaired.
    #[error("appdir is broken: no usable installed version found at {0}")]
    Broken(PathBuf),

    /// Another process holds the appdir lock and it is not stale.
    #[error("appdir lock busy: {0}")]
    LockBusy(PathBuf),

    /// The target version's files are in use and cannot be disabled/removed.
    #[error("version locked (in use): {0}")]
    VersionLocked(String),

    /// An update operation was attempted with no `VersionFinder` attached.
    #[error("no VersionFinder attached to this Updater")]
    NoVersionFinder,

    /// A filesystem operation needed elevated privileges.
    #[error("permission denied performing {operation} on {path}")]
    PermissionDenied { operation: &'static str, path: PathBuf },

    /// The `VersionFinder` failed to find or fetch a version.
    #[error("transport error: {0}")]
    Transport(String),

    /// A version directory name, or a manifest path, was malformed.
    #[error("naming error: {0}")]
    Naming(String),

    /// Wrapped I/O error that isn't classified as one of the above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wrapped JSON (de)serialization error, used by the privileged-proxy
    /// control-record protocol and the HTTP finder's manifest parsing.
    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RefitError {
    /// Build a [`RefitError::PermissionDenied`] from an I/O error if it
    /// looks like one, otherwise fall through to a plain [`RefitError::Io`].
    ///
    /// Rust's `std::io::Error` gives us `ErrorKind::PermissionDenied`
    /// directly, so no errno comparison is needed to tell a permissions
    /// failure apart from any other I/O error.
    pub fn classify_io(err: io::Error, operation: &'static str, path: PathBuf) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            RefitError::PermissionDenied { operation, path }
        } else {
            RefitError::Io(err)
        }
    }

    /// True if this is the kind of failure `Updater::auto_update` should
    /// retry once via a `PrivilegedProxy`.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RefitError::PermissionDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, RefitError>;
