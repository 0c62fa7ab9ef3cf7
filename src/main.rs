//! Demo CLI entry point.
//!
//! Two invocation shapes are intercepted before `clap` ever sees the
//! argument list, both internal re-exec protocols documented on
//! [`refit::updater::Updater`]:
//!
//! - `--refit-proxy-serve`: this process is the elevated child spawned by
//!   `SubprocessProxy`; service control records over stdin/stdout until
//!   the parent closes the pipe.
//! - `--refit-cleanup-at-exit --refit-parent-pid <pid> --refit-appdir
//!   <dir> --refit-app-name <name> --refit-platform <platform>`: this
//!   process was spawned by `Updater::cleanup_at_exit`; wait briefly for
//!   the parent to exit, then run one cleanup pass and exit 0/1.

use std::thread;
use std::time::Duration;

use anyhow::Result;

mod cli;

use cli::Cli;

/// How long the cleanup-at-exit child waits for its parent to finish
/// exiting before it starts mutating the appdir.
const PARENT_EXIT_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--refit-proxy-serve") {
        return refit::proxy::serve().map_err(Into::into);
    }

    if args.iter().any(|a| a == "--refit-cleanup-at-exit") {
        run_cleanup_at_exit_child(&args)?;
        return Ok(());
    }

    let cli = Cli::parse();
    cli.run()
}

fn run_cleanup_at_exit_child(args: &[String]) -> Result<()> {
    let appdir = arg_value(args, "--refit-appdir").expect("--refit-appdir required");
    let app_name = arg_value(args, "--refit-app-name").expect("--refit-app-name required");
    let platform = arg_value(args, "--refit-platform").expect("--refit-platform required");

    thread::sleep(PARENT_EXIT_GRACE);

    let mut updater = refit::Updater::new(appdir, app_name, platform);
    let report = updater.cleanup()?;
    if !report.fully_cleaned() {
        std::process::exit(1);
    }
    Ok(())
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
