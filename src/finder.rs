//! The version-discovery/download collaborator: a trait plus two
//! implementations so the crate is buildable and testable end to end.
//!
//! `LocalVersionFinder` is filesystem-backed and is what the test suite
//! drives for every end-to-end scenario. `HttpVersionFinder` is real,
//! working code (atomic temp-file download with `indicatif` progress,
//! JSON-over-HTTP "latest version" lookup) but deliberately does not
//! implement signature verification or binary patch application.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{RefitError, Result};
use crate::version::VersionValue;

/// Progress callback contract: return `false` to cancel the fetch.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) -> bool + 'a;

/// The out-of-scope version discovery/download collaborator.
pub trait VersionFinder {
    /// All versions this finder knows about for `app`, in no particular
    /// order.
    fn find_versions(&self, app: &str) -> Result<Vec<VersionValue>>;

    /// A staged directory for `app`/`v`, if already fetched/cached.
    fn has_version(&self, app: &str, v: &VersionValue) -> Result<Option<PathBuf>>;

    /// Fetch `app`/`v`, pumping `progress` as bytes arrive. Returns the
    /// path to the fully materialized staging directory. `progress`
    /// returning `false` cancels the fetch with `RefitError::Transport`.
    fn fetch_version(
        &self,
        app: &str,
        v: &VersionValue,
        progress: &mut ProgressFn<'_>,
    ) -> Result<PathBuf>;

    fn needs_cleanup(&self, app: &str) -> Result<bool>;

    fn cleanup(&self, app: &str) -> Result<()>;
}

/// A directory of pre-staged version directories
/// (`<root>/<name>-<version>-<platform>/`), already laid out exactly as
/// `BootstrapSwapper::stage` expects. Used by the demo CLI and the whole
/// test suite — no network involved.
pub struct LocalVersionFinder {
    root: PathBuf,
    platform: String,
}

impl LocalVersionFinder {
    pub fn new(root: impl Into<PathBuf>, platform: impl Into<String>) -> Self {
        LocalVersionFinder {
            root: root.into(),
            platform: platform.into(),
        }
    }

    fn dir_for(&self, app: &str, v: &VersionValue) -> PathBuf {
        self.root
            .join(crate::naming::join(app, v.as_str(), &self.platform))
    }
}

impl VersionFinder for LocalVersionFinder {
    fn find_versions(&self, app: &str) -> Result<Vec<VersionValue>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dirname = match entry.file_name().into_string() {
                Ok(s) => s,
                Err(_) => continue,
            };
            if let Ok((name, version_str, _)) = crate::naming::split(&dirname) {
                if name == app {
                    if let Ok(v) = VersionValue::parse(&version_str) {
                        out.push(v);
                    }
                }
            }
        }
        Ok(out)
    }

    fn has_version(&self, app: &str, v: &VersionValue) -> Result<Option<PathBuf>> {
        let dir = self.dir_for(app, v);
        Ok(if dir.is_dir() { Some(dir) } else { None })
    }

    fn fetch_version(
        &self,
        app: &str,
        v: &VersionValue,
        progress: &mut ProgressFn<'_>,
    ) -> Result<PathBuf> {
        match self.has_version(app, v)? {
            Some(dir) => {
                progress(1, Some(1));
                Ok(dir)
            }
            None => Err(RefitError::Transport(format!(
                "no staged directory for {app} {v} under {}",
                self.root.display()
            ))),
        }
    }

    fn needs_cleanup(&self, _app: &str) -> Result<bool> {
        Ok(false)
    }

    fn cleanup(&self, _app: &str) -> Result<()> {
        Ok(())
    }
}

/// The JSON shape returned by an `HttpVersionFinder`'s manifest endpoint.
#[derive(Debug, Deserialize)]
struct RemoteManifest {
    versions: Vec<RemoteVersionEntry>,
}

#[derive(Debug, Deserialize)]
struct RemoteVersionEntry {
    version: String,
    url: String,
    #[serde(default)]
    sha256: Option<String>,
}

/// Fetches a JSON version manifest and `tar.gz` payloads over HTTPS,
/// downloading atomically (temp file then rename) with an `indicatif`
/// progress bar.
pub struct HttpVersionFinder {
    base_url: String,
    staging_dir: PathBuf,
    client: Client,
}

impl HttpVersionFinder {
    pub fn new(base_url: impl Into<String>, staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("refit/", env!("CARGO_PKG_VERSION"))),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RefitError::Transport(e.to_string()))?;
        Ok(HttpVersionFinder {
            base_url: base_url.into(),
            staging_dir: staging_dir.into(),
            client,
        })
    }

    fn manifest_url(&self, app: &str) -> String {
        format!("{}/{}/manifest.json", self.base_url.trim_end_matches('/'), app)
    }

    fn fetch_manifest(&self, app: &str) -> Result<RemoteManifest> {
        let resp = self
            .client
            .get(self.manifest_url(app))
            .send()
            .map_err(|e| RefitError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RefitError::Transport(format!(
                "unexpected status {} fetching manifest for {app}",
                resp.status()
            )));
        }
        resp.json()
            .map_err(|e| RefitError::Transport(format!("parsing manifest: {e}")))
    }
}

impl VersionFinder for HttpVersionFinder {
    fn find_versions(&self, app: &str) -> Result<Vec<VersionValue>> {
        let manifest = self.fetch_manifest(app)?;
        Ok(manifest
            .versions
            .iter()
            .filter_map(|e| VersionValue::parse(&e.version).ok())
            .collect())
    }

    fn has_version(&self, app: &str, v: &VersionValue) -> Result<Option<PathBuf>> {
        let dir = self
            .staging_dir
            .join(crate::naming::join(app, v.as_str(), "download"));
        Ok(if dir.is_dir() { Some(dir) } else { None })
    }

    fn fetch_version(
        &self,
        app: &str,
        v: &VersionValue,
        progress: &mut ProgressFn<'_>,
    ) -> Result<PathBuf> {
        let manifest = self.fetch_manifest(app)?;
        let entry = manifest
            .versions
            .iter()
            .find(|e| e.version == v.as_str())
            .ok_or_else(|| RefitError::Transport(format!("version {v} not advertised by finder")))?;

        let staging = self
            .staging_dir
            .join(crate::naming::join(app, v.as_str(), "download"));
        fs::create_dir_all(&self.staging_dir)?;
        let tarball = self.staging_dir.join(format!("{app}-{v}.tar.gz.part"));

        let resp = self
            .client
            .get(&entry.url)
            .send()
            .map_err(|e| RefitError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RefitError::Transport(format!(
                "unexpected status {} downloading {}",
                resp.status(),
                entry.url
            )));
        }

        let total = resp.content_length();
        let pb = match total {
            Some(t) => {
                let pb = ProgressBar::new(t);
                if let Ok(style) =
                    ProgressStyle::with_template("{bar} {bytes}/{total_bytes} {eta}")
                {
                    pb.set_style(style.progress_chars("#>-"));
                }
                pb
            }
            None => ProgressBar::new_spinner(),
        };

        let mut reader = resp;
        let mut out = fs::File::create(&tarball)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut downloaded = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| RefitError::Transport(e.to_string()))?;
            if n == 0 {
                break;
            }
            use std::io::Write;
            out.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            downloaded += n as u64;
            pb.set_position(downloaded);
            if !progress(downloaded, total) {
                pb.finish_and_clear();
                let _ = fs::remove_file(&tarball);
                return Err(RefitError::Transport("fetch cancelled by caller".into()));
            }
        }
        pb.finish_and_clear();

        if let Some(expected) = &entry.sha256 {
            let got = hex::encode(hasher.finalize());
            if &got != expected {
                let _ = fs::remove_file(&tarball);
                return Err(RefitError::Transport(format!(
                    "checksum mismatch for {app} {v}: expected {expected}, got {got}"
                )));
            }
        }

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        let tar_gz = fs::File::open(&tarball)?;
        let dec = flate2::read::GzDecoder::new(tar_gz);
        let mut archive = tar::Archive::new(dec);
        archive
            .unpack(&staging)
            .map_err(|e| RefitError::Transport(format!("extracting {}: {e}", tarball.display())))?;
        let _ = fs::remove_file(&tarball);

        info!(app, version = %v, "fetched version");
        Ok(staging)
    }

    fn needs_cleanup(&self, _app: &str) -> Result<bool> {
        // Anything left in the staging dir from a cancelled/failed fetch
        // (a `.part` tarball) is this finder's own cache to purge.
        let entries = match fs::read_dir(&self.staging_dir) {
            Ok(e) => e,
            Err(_) => return Ok(false),
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".part")))
    }

    fn cleanup(&self, _app: &str) -> Result<()> {
        let entries = match fs::read_dir(&self.staging_dir) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy().ends_with(".part") {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "failed to purge stale download");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stage(root: &Path, app: &str, version: &str) {
        let dir = root.join(crate::naming::join(app, version, "linux-x86_64"));
        fs::create_dir_all(&dir).unwrap();
    }

    #[test]
    fn local_finder_lists_and_fetches_staged_versions() {
        let dir = tempdir().unwrap();
        stage(dir.path(), "app", "1.0.0");
        stage(dir.path(), "app", "1.1.0");
        let finder = LocalVersionFinder::new(dir.path(), "linux-x86_64");
        let versions = finder.find_versions("app").unwrap();
        assert_eq!(versions.len(), 2);

        let v = VersionValue::parse("1.1.0").unwrap();
        let mut calls = 0;
        let path = finder
            .fetch_version("app", &v, &mut |_, _| {
                calls += 1;
                true
            })
            .unwrap();
        assert!(path.is_dir());
        assert_eq!(calls, 1);
    }

    #[test]
    fn local_finder_errors_on_unknown_version() {
        let dir = tempdir().unwrap();
        let finder = LocalVersionFinder::new(dir.path(), "linux-x86_64");
        let v = VersionValue::parse("9.9.9").unwrap();
        let err = finder.fetch_version("app", &v, &mut |_, _| true).unwrap_err();
        assert!(matches!(err, RefitError::Transport(_)));
    }
}
