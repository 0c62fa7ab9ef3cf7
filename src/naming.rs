//! Version-directory name parsing and composition.
//!
//! Directory names are `<name>-<version>-<platform>`. The parser tolerates
//! extra `-`-separated components inside `version`, which means splitting
//! from the outside in: the last component is the platform, the first is
//! the name, and everything in between is the version.

use crate::error::{RefitError, Result};

/// Split a version-directory name into `(name, version, platform)`.
pub fn split(dirname: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = dirname.split('-').collect();
    if parts.len() < 3 {
        return Err(RefitError::Naming(format!(
            "not a version directory name: {dirname}"
        )));
    }
    let name = parts[0].to_string();
    let platform = parts[parts.len() - 1].to_string();
    let version = parts[1..parts.len() - 1].join("-");
    if name.is_empty() || version.is_empty() || platform.is_empty() {
        return Err(RefitError::Naming(format!(
            "not a version directory name: {dirname}"
        )));
    }
    Ok((name, version, platform))
}

/// Compose `(name, version, platform)` into a version-directory name.
/// Round-trips with [`split`].
pub fn join(name: &str, version: &str, platform: &str) -> String {
    format!("{name}-{version}-{platform}")
}

/// True if `dirname` parses as a version-directory name belonging to
/// `name`.
pub fn belongs_to(dirname: &str, name: &str) -> bool {
    match split(dirname) {
        Ok((n, _, _)) => n == name,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let dirname = join("myapp", "1.2.3", "linux-x86_64");
        assert_eq!(dirname, "myapp-1.2.3-linux-x86_64");
        let (n, v, p) = split(&dirname).unwrap();
        assert_eq!(n, "myapp");
        assert_eq!(v, "1.2.3");
        assert_eq!(p, "linux-x86_64");
    }

    #[test]
    fn tolerates_dashes_in_version() {
        let (n, v, p) = split("myapp-1.2.3-rc-1-linux-x86_64").unwrap();
        assert_eq!(n, "myapp");
        assert_eq!(v, "1.2.3-rc-1");
        assert_eq!(p, "linux-x86_64");
    }

    #[test]
    fn rejects_malformed() {
        assert!(split("myapp").is_err());
        assert!(split("myapp-1.0").is_err());
    }

    #[test]
    fn belongs_to_checks_name() {
        let dirname = join("myapp", "1.0.0", "linux-x86_64");
        assert!(belongs_to(&dirname, "myapp"));
        assert!(!belongs_to(&dirname, "otherapp"));
    }
}
