//! The demo CLI: a thin wrapper over the `Updater` façade.
//!
//! A `clap::Parser`/`Subcommand` shape (`anyhow::{Result, Context, bail}`,
//! `ConfigCmd::{Init,Show}`) where every subcommand calls into
//! [`refit::Updater`].

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use refit::config::{Config, ConfigPaths};
use refit::updater::Updater;

#[derive(Parser, Debug)]
#[command(name = "refit", version, about = "Appdir auto-update engine (demo CLI)")]
pub struct Cli {
    /// Override config path.
    #[arg(long, global = true, env = "REFIT_CONFIG_PATH")]
    pub config: Option<String>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a specific version (fetching it first if the attached
    /// finder doesn't already have it staged).
    Install(VersionArgs),
    /// Uninstall a specific version (demotes it; actual file purge is
    /// lazy, done by the next `cleanup`).
    Uninstall(VersionArgs),
    /// Run `find -> fetch -> install -> uninstall(previous) -> cleanup`.
    Update,
    /// Show the appdir, active/current version, and all installed versions.
    Status,
    /// Run the cleanup/reconciliation pass and report whether it fully succeeded.
    Cleanup,
    /// Manage the on-disk engine configuration.
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Version string, e.g. "1.2.3".
    pub version: String,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Create a default config file if one doesn't already exist.
    Init,
    /// Show the effective configuration (after env/file overrides).
    Show,
}

impl Cli {
    pub fn parse() -> Self {
        <Cli as Parser>::parse()
    }

    pub fn run(&self) -> Result<()> {
        let cfg_paths = ConfigPaths::from_override(self.config.as_deref());
        let cfg = Config::load_or_default(&cfg_paths)
            .with_context(|| format!("loading config from {}", cfg_paths.config_display()))?;

        if self.verbose {
            eprintln!("[refit] using config at {}", cfg_paths.config_display());
        }

        match &self.cmd {
            Commands::Install(args) => {
                let mut updater = Updater::from_config(&cfg)?;
                updater.reinitialize()?;
                updater.install_version(&args.version)?;
                println!("Installed {} into {}", args.version, updater.appdir().display());
                Ok(())
            }
            Commands::Uninstall(args) => {
                let mut updater = Updater::from_config(&cfg)?;
                updater.reinitialize()?;
                updater.uninstall_version(&args.version)?;
                println!("Uninstalled {} (purge happens on next cleanup)", args.version);
                Ok(())
            }
            Commands::Update => {
                let mut updater = Updater::from_config(&cfg)?;
                updater.reinitialize()?;
                match updater.auto_update(|msg| {
                    if self.verbose {
                        eprintln!("[refit] {msg}");
                    }
                })? {
                    Some(v) => println!("Updated to {v}"),
                    None => println!("Already up to date"),
                }
                Ok(())
            }
            Commands::Status => {
                let mut updater = Updater::from_config(&cfg)?;
                updater.reinitialize()?;
                println!("Appdir        : {}", updater.appdir().display());
                match updater.active_version() {
                    Some(v) => println!("Active version: {v}"),
                    None => println!("Active version: <none>"),
                }
                match updater.current_version() {
                    Some(v) => println!("Best version  : {v}"),
                    None => println!("Best version  : <none installed>"),
                }
                Ok(())
            }
            Commands::Cleanup => {
                let mut updater = Updater::from_config(&cfg)?;
                updater.reinitialize()?;
                let report = updater.cleanup()?;
                if report.fully_cleaned() {
                    println!("Cleanup complete ({} action(s))", report.attempted);
                } else {
                    println!(
                        "Cleanup incomplete: {}/{} action(s) failed",
                        report.failed.len(),
                        report.attempted
                    );
                    for (action, err) in &report.failed {
                        println!("  {action}: {err}");
                    }
                    bail!("cleanup did not fully succeed");
                }
                Ok(())
            }
            Commands::Config(sub) => match sub {
                ConfigCmd::Init => {
                    cfg.save_if_missing(&cfg_paths)?;
                    println!("Config written to {}", cfg_paths.config_display());
                    Ok(())
                }
                ConfigCmd::Show => {
                    println!("{}", toml::to_string_pretty(&cfg)?);
                    Ok(())
                }
            },
        }
    }
}
