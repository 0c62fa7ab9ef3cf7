//! Version string parsing and ordering.
//!
//! Scheme: `MAJOR.MINOR.PATCH[SUFFIX]`. Numeric components
//! compare numerically; a trailing suffix (`dev`, `a`, `b`, `rc`, `pre`,
//! optionally followed by digits, e.g. `rc1`) sorts *below* the unadorned
//! version, and two suffixed versions with the same numeric prefix compare
//! lexicographically by suffix.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{RefitError, Result};

/// A parsed, totally-ordered version value.
#[derive(Debug, Clone, Eq)]
pub struct VersionValue {
    raw: String,
    numeric: Vec<u64>,
    suffix: Option<String>,
}

const PRERELEASE_TAGS: &[&str] = &["dev", "a", "b", "rc", "pre"];

impl VersionValue {
    /// Parse a version string. Accepts any number of dot-separated numeric
    /// components (not just three), with an optional trailing suffix on
    /// the last component (e.g. `"1.2.3rc1"`, `"2.0dev"`).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RefitError::Naming("empty version string".into()));
        }

        let mut numeric = Vec::new();
        let mut suffix = None;
        let parts: Vec<&str> = s.split('.').collect();

        for (idx, part) in parts.iter().enumerate() {
            let is_last = idx == parts.len() - 1;
            let split_at = part.find(|c: char| !c.is_ascii_digit());
            match split_at {
                None => {
                    let n: u64 = part.parse().map_err(|_| {
                        RefitError::Naming(format!("bad version component: {part}"))
                    })?;
                    numeric.push(n);
                }
                Some(pos) if is_last => {
                    let (num_part, suf_part) = part.split_at(pos);
                    if !num_part.is_empty() {
                        let n: u64 = num_part.parse().map_err(|_| {
                            RefitError::Naming(format!("bad version component: {part}"))
                        })?;
                        numeric.push(n);
                    }
                    if !suf_part.is_empty() {
                        suffix = Some(suf_part.to_ascii_lowercase());
                    }
                }
                Some(_) => {
                    return Err(RefitError::Naming(format!(
                        "suffix only allowed on the final version component: {s}"
                    )));
                }
            }
        }

        if numeric.is_empty() && suffix.is_none() {
            return Err(RefitError::Naming(format!("unparseable version: {s}")));
        }

        Ok(VersionValue {
            raw: s.to_string(),
            numeric,
            suffix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the suffix (if any) is one of the known pre-release tags.
    /// Unknown suffixes still sort below the unadorned version (by virtue
    /// of `Some(_) < None` in [`Ord`]), but this is exposed for callers
    /// that want to special-case known pre-release channels.
    pub fn is_known_prerelease(&self) -> bool {
        match &self.suffix {
            None => false,
            Some(s) => PRERELEASE_TAGS.iter().any(|tag| s.starts_with(tag)),
        }
    }
}

impl fmt::Display for VersionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for VersionValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for VersionValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionValue {
    fn cmp(&self, other: &Self) -> Ordering {
        // Numeric components compare pairwise, missing trailing components
        // treated as zero (so "1.2" == "1.2.0" numerically).
        let len = self.numeric.len().max(other.numeric.len());
        for i in 0..len {
            let a = self.numeric.get(i).copied().unwrap_or(0);
            let b = other.numeric.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        // Same numeric value: a suffix means "pre-release", which sorts
        // below the unadorned version. Two suffixes compare lexically.
        match (&self.suffix, &other.suffix) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ordering() {
        let a = VersionValue::parse("1.0.0").unwrap();
        let b = VersionValue::parse("1.0.1").unwrap();
        let c = VersionValue::parse("1.1.0").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn prerelease_sorts_below_release() {
        let rel = VersionValue::parse("1.0.0").unwrap();
        let rc = VersionValue::parse("1.0.0rc1").unwrap();
        let dev = VersionValue::parse("1.0.0dev").unwrap();
        assert!(rc < rel);
        assert!(dev < rel);
    }

    #[test]
    fn missing_trailing_components_are_zero() {
        let a = VersionValue::parse("1.2").unwrap();
        let b = VersionValue::parse("1.2.0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn total_order_is_transitive_sample() {
        let vs = ["0.9.0", "1.0.0dev", "1.0.0rc1", "1.0.0", "1.0.1", "2.0.0"];
        let parsed: Vec<VersionValue> =
            vs.iter().map(|s| VersionValue::parse(s).unwrap()).collect();
        for w in parsed.windows(2) {
            assert!(w[0] < w[1], "{} should be < {}", w[0], w[1]);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(VersionValue::parse("").is_err());
        assert!(VersionValue::parse("abc").is_err());
    }
}
