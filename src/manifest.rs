//! Bootstrap manifest parsing.
//!
//! `bootstrap-manifest.txt` is a UTF-8, LF-terminated list of relative
//! paths a version expects to find in the appdir's bootstrap environment.
//! Each line is trimmed and normalized; lines that are absolute or escape
//! the appdir via `..` are silently dropped rather than rejected —
//! `read_manifest` never fails just because one line in the file is
//! malformed, since a single untrusted/corrupted line shouldn't brick
//! reads of an otherwise-good manifest.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::Result;

/// A path guaranteed, by construction, to be relative and non-escaping.
///
/// Constructing a `RelPath` is the single point where P4 ("no path
/// written/removed as a result of manifest processing escapes the
/// appdir") is enforced; every caller downstream can just trust the
/// value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(PathBuf);

impl RelPath {
    /// Build a `RelPath` from a raw manifest line, or `None` if the line
    /// is empty, absolute, or escapes upward.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        // Normalize both forward slashes and native separators so manifests
        // written on one platform still parse correctly on another.
        let normalized = trimmed.replace('\\', "/").replace('/', std::path::MAIN_SEPARATOR_STR);
        let path = PathBuf::from(normalized);
        if path.is_absolute() {
            return None;
        }
        let mut depth: i64 = 0;
        for comp in path.components() {
            match comp {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return None;
                    }
                }
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if path.as_os_str().is_empty() {
            return None;
        }
        Some(RelPath(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn join_onto(&self, base: &Path) -> PathBuf {
        base.join(&self.0)
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for RelPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Read and parse a bootstrap manifest file. Returns an empty set if the
/// file doesn't exist.
pub fn read_manifest(path: &Path) -> Result<BTreeSet<RelPath>> {
    if !path.is_file() {
        return Ok(BTreeSet::new());
    }
    let text = fs::read_to_string(path)?;
    Ok(parse_manifest(&text))
}

/// Parse manifest text directly (split out for testing without touching
/// the filesystem).
pub fn parse_manifest(text: &str) -> BTreeSet<RelPath> {
    text.lines().filter_map(RelPath::new).collect()
}

/// Serialize a manifest set back to the on-disk LF-terminated text format.
pub fn write_manifest(paths: &BTreeSet<RelPath>) -> String {
    let mut out = String::new();
    for p in paths {
        out.push_str(&p.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_absolute_and_escaping_lines() {
        let text = "lib/a.so\n/etc/passwd\n../../etc/shadow\nbin/app\n";
        let parsed = parse_manifest(text);
        let strs: BTreeSet<String> = parsed.iter().map(|p| p.to_string()).collect();
        assert!(strs.contains(&"lib/a.so".replace('/', std::path::MAIN_SEPARATOR_STR)));
        assert!(strs.contains(&"bin/app".replace('/', std::path::MAIN_SEPARATOR_STR)));
        assert_eq!(strs.len(), 2);
    }

    #[test]
    fn trims_whitespace() {
        let rp = RelPath::new("  lib/a.so  \n").unwrap();
        assert_eq!(rp.to_string(), "lib/a.so".replace('/', std::path::MAIN_SEPARATOR_STR));
    }

    #[test]
    fn internal_parent_refs_that_stay_inside_are_allowed() {
        // "a/../b" normalizes to something that never escapes the root.
        assert!(RelPath::new("a/../b").is_some());
    }

    #[test]
    fn missing_file_returns_empty() {
        let result = read_manifest(Path::new("/nonexistent/path/to/manifest.txt")).unwrap();
        assert!(result.is_empty());
    }
}
