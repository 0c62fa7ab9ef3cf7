//! On-disk engine configuration: TOML-backed, with unknown-field
//! tolerance and a platform config directory resolved via
//! `directories::ProjectDirs`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::finder::{HttpVersionFinder, LocalVersionFinder, VersionFinder};

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub dir: PathBuf,
    pub file: PathBuf,
}

impl ConfigPaths {
    pub fn from_override(override_path: Option<&str>) -> Self {
        if let Some(p) = override_path {
            let file = PathBuf::from(shellexpand::tilde(p).into_owned());
            let dir = file.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            return Self { dir, file };
        }
        let proj = ProjectDirs::from("dev", "refit", "refit").expect("cannot determine config dir");
        let dir = proj.config_dir().to_path_buf();
        let file = dir.join("refit.toml");
        Self { dir, file }
    }

    pub fn config_display(&self) -> String {
        self.file.display().to_string()
    }
}

/// Where `Updater::from_config` should get its `VersionFinder` from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinderConfig {
    /// No finder attached — `find_update`/`fetch_version` fail with
    /// `NoVersionFinder` until one is set programmatically.
    None,
    /// Filesystem-backed staging directory (what the demo CLI and test
    /// suite use).
    Local { root: PathBuf },
    /// A real HTTP-based finder.
    Http { base_url: String, staging_dir: PathBuf },
}

impl Default for FinderConfig {
    fn default() -> Self {
        FinderConfig::None
    }
}

impl FinderConfig {
    pub fn build(&self) -> crate::error::Result<Option<Box<dyn VersionFinder>>> {
        Ok(match self {
            FinderConfig::None => None,
            FinderConfig::Local { root } => {
                Some(Box::new(LocalVersionFinder::new(root.clone(), default_platform())))
            }
            FinderConfig::Http { base_url, staging_dir } => Some(Box::new(HttpVersionFinder::new(
                base_url.clone(),
                staging_dir.clone(),
            )?)),
        })
    }
}

/// Reserved for future proxy/network settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub proxy_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub appdir: PathBuf,
    pub app_name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,
    #[serde(default)]
    pub finder: FinderConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_lock_timeout() -> u64 {
    3600
}

fn default_keep_versions() -> usize {
    2
}

/// A platform token such as `linux-x86_64`/`win32-amd64`, derived from
/// the compile-time target without reaching for a runtime
/// target-triple-sniffing crate.
pub fn default_platform() -> String {
    let os = if cfg!(target_os = "windows") {
        "win32"
    } else if cfg!(target_os = "macos") {
        "macosx"
    } else {
        "linux"
    };
    let arch = if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        std::env::consts::ARCH
    };
    format!("{os}-{arch}")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            appdir: PathBuf::from("~/.local/opt/refit-demo"),
            app_name: "demoapp".to_string(),
            platform: default_platform(),
            lock_timeout_secs: default_lock_timeout(),
            keep_versions: default_keep_versions(),
            finder: FinderConfig::None,
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_default(paths: &ConfigPaths) -> Result<Self> {
        if paths.file.exists() {
            let s = fs::read_to_string(&paths.file)
                .with_context(|| format!("reading {}", paths.config_display()))?;
            let cfg: Config = toml::from_str(&s)
                .with_context(|| format!("parsing {}", paths.config_display()))?;
            Ok(cfg)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_if_missing(&self, paths: &ConfigPaths) -> Result<()> {
        if !paths.dir.exists() {
            fs::create_dir_all(&paths.dir)
                .with_context(|| format!("creating {}", paths.dir.display()))?;
        }
        if !paths.file.exists() {
            let out = toml::to_string_pretty(self).context("serializing default config")?;
            fs::write(&paths.file, out)
                .with_context(|| format!("writing {}", paths.config_display()))?;
        }
        Ok(())
    }

    /// Expand a leading `~` in `appdir`.
    pub fn resolved_appdir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.appdir.to_string_lossy()).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.app_name, cfg.app_name);
        assert_eq!(back.keep_versions, cfg.keep_versions);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let s = r#"
appdir = "/opt/app"
app_name = "app"
kind = "none"

[legacy_unused_section]
foo = "bar"
"#;
        let cfg: Config = toml::from_str(s).unwrap();
        assert_eq!(cfg.app_name, "app");
    }
}
