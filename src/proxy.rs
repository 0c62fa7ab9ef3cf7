//! Privilege-escalation collaborator for operations that need write access
//! to a system-owned install directory.
//!
//! `SubprocessProxy` re-execs `std::env::current_exe()` with a platform
//! elevation prefix and exchanges length-prefixed `serde_json` control
//! records with the elevated child over its stdin/stdout.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::{RefitError, Result};

/// Every `Updater` operation that may require elevated filesystem access.
pub trait PrivilegedProxy {
    fn lock(&mut self) -> Result<()>;
    fn unlock(&mut self) -> Result<()>;
    fn has_root(&self) -> bool;
    fn cleanup(&mut self) -> Result<bool>;
    fn cleanup_at_exit(&mut self) -> Result<()>;
    fn fetch_version_iter(&mut self, app: &str, version: &str) -> Result<PathBuf>;
    fn install_version(&mut self, app: &str, version: &str) -> Result<()>;
    fn uninstall_version(&mut self, app: &str, version: &str) -> Result<()>;
}

/// The initial handshake record sent to the elevated child on spawn,
/// identifying which app installation it should operate on.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlRecord {
    pub appdir: PathBuf,
    pub app_name: String,
    pub platform: String,
}

#[derive(Debug, Serialize, Deserialize)]
enum ProxyRequest {
    Lock,
    Unlock,
    Cleanup,
    FetchVersion { app: String, version: String },
    InstallVersion { app: String, version: String },
    UninstallVersion { app: String, version: String },
}

#[derive(Debug, Serialize, Deserialize)]
enum ProxyResponse {
    Ok,
    OkBool(bool),
    OkPath(PathBuf),
    Err(String),
}

/// Re-execs the current binary with a platform elevation prefix and a
/// `--refit-proxy-serve` subcommand, then exchanges length-prefixed JSON
/// control records over its stdin/stdout.
pub struct SubprocessProxy {
    control: ControlRecord,
    child: Option<Child>,
}

impl SubprocessProxy {
    pub fn new(control: ControlRecord) -> Self {
        SubprocessProxy { control, child: None }
    }

    fn ensure_spawned(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let exe = std::env::current_exe().map_err(RefitError::Io)?;
        let mut cmd = elevation_command(&exe);
        cmd.arg("--refit-proxy-serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|_| RefitError::PermissionDenied {
            operation: "spawn privileged proxy",
            path: exe.clone(),
        })?;

        {
            let stdin = child.stdin.as_mut().expect("piped stdin");
            write_record(stdin, &self.control)?;
        }
        self.child = Some(child);
        Ok(())
    }

    fn roundtrip(&mut self, req: &ProxyRequest) -> Result<ProxyResponse> {
        self.ensure_spawned()?;
        let child = self.child.as_mut().expect("spawned");
        {
            let stdin = child.stdin.as_mut().expect("piped stdin");
            write_record(stdin, req)?;
        }
        let stdout = child.stdout.as_mut().expect("piped stdout");
        read_record(stdout)
    }
}

impl PrivilegedProxy for SubprocessProxy {
    fn lock(&mut self) -> Result<()> {
        match self.roundtrip(&ProxyRequest::Lock)? {
            ProxyResponse::Ok => Ok(()),
            ProxyResponse::Err(e) => Err(RefitError::Transport(e)),
            _ => Err(RefitError::Transport("unexpected proxy response".into())),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        match self.roundtrip(&ProxyRequest::Unlock)? {
            ProxyResponse::Ok => Ok(()),
            ProxyResponse::Err(e) => Err(RefitError::Transport(e)),
            _ => Err(RefitError::Transport("unexpected proxy response".into())),
        }
    }

    fn has_root(&self) -> bool {
        self.child.is_some()
    }

    fn cleanup(&mut self) -> Result<bool> {
        match self.roundtrip(&ProxyRequest::Cleanup)? {
            ProxyResponse::OkBool(b) => Ok(b),
            ProxyResponse::Err(e) => Err(RefitError::Transport(e)),
            _ => Err(RefitError::Transport("unexpected proxy response".into())),
        }
    }

    fn cleanup_at_exit(&mut self) -> Result<()> {
        // Registering the exit hook itself needs no elevation; only the
        // eventual cleanup it triggers does, and that re-enters through
        // `cleanup` in the respawned child.
        Ok(())
    }

    fn fetch_version_iter(&mut self, app: &str, version: &str) -> Result<PathBuf> {
        match self.roundtrip(&ProxyRequest::FetchVersion {
            app: app.to_string(),
            version: version.to_string(),
        })? {
            ProxyResponse::OkPath(p) => Ok(p),
            ProxyResponse::Err(e) => Err(RefitError::Transport(e)),
            _ => Err(RefitError::Transport("unexpected proxy response".into())),
        }
    }

    fn install_version(&mut self, app: &str, version: &str) -> Result<()> {
        match self.roundtrip(&ProxyRequest::InstallVersion {
            app: app.to_string(),
            version: version.to_string(),
        })? {
            ProxyResponse::Ok => Ok(()),
            ProxyResponse::Err(e) => Err(RefitError::Transport(e)),
            _ => Err(RefitError::Transport("unexpected proxy response".into())),
        }
    }

    fn uninstall_version(&mut self, app: &str, version: &str) -> Result<()> {
        match self.roundtrip(&ProxyRequest::UninstallVersion {
            app: app.to_string(),
            version: version.to_string(),
        })? {
            ProxyResponse::Ok => Ok(()),
            ProxyResponse::Err(e) => Err(RefitError::Transport(e)),
            _ => Err(RefitError::Transport("unexpected proxy response".into())),
        }
    }
}

impl Drop for SubprocessProxy {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Build the platform-appropriate elevation command. Linux/macOS try
/// `sudo -n` (non-interactive; callers running genuinely unattended
/// should already be root or have passwordless sudo configured) falling
/// back to `pkexec`. The Windows path has no non-interactive UAC
/// equivalent to script here, so it documents the gap rather than
/// faking it: the proxy surfaces `PermissionDenied` unless the process
/// is already elevated.
fn elevation_command(exe: &std::path::Path) -> Command {
    #[cfg(target_os = "windows")]
    {
        // No scriptable non-interactive elevation path on Windows; the
        // caller is expected to already be running elevated, or to
        // handle the resulting `PermissionDenied` by prompting the user
        // through its own UI.
        Command::new(exe)
    }
    #[cfg(not(target_os = "windows"))]
    {
        if which_on_path("sudo") {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(exe);
            cmd
        } else if which_on_path("pkexec") {
            let mut cmd = Command::new("pkexec");
            cmd.arg(exe);
            cmd
        } else {
            Command::new(exe)
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn which_on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
        })
        .unwrap_or(false)
}

fn write_record<T: Serialize>(w: &mut impl Write, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    w.write_all(&(bytes.len() as u32).to_be_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

fn read_record<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Entry point for the `--refit-proxy-serve` subcommand: reads the
/// initial `ControlRecord`, then services `ProxyRequest`s against a real
/// `Updater` until stdin closes. Runs as the elevated child process.
pub fn serve() -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdin_lock = stdin.lock();
    let stdout = std::io::stdout();
    let mut stdout_lock = stdout.lock();

    let control: ControlRecord = read_record(&mut stdin_lock)?;
    let mut updater = crate::updater::Updater::new(&control.appdir, &control.app_name, &control.platform);

    loop {
        let req: ProxyRequest = match read_record(&mut stdin_lock) {
            Ok(r) => r,
            Err(_) => break,
        };
        let resp = match req {
            ProxyRequest::Lock => match updater.lock() {
                Ok(()) => ProxyResponse::Ok,
                Err(e) => ProxyResponse::Err(e.to_string()),
            },
            ProxyRequest::Unlock => match updater.unlock() {
                Ok(()) => ProxyResponse::Ok,
                Err(e) => ProxyResponse::Err(e.to_string()),
            },
            ProxyRequest::Cleanup => match updater.cleanup() {
                Ok(report) => ProxyResponse::OkBool(report.fully_cleaned()),
                Err(e) => ProxyResponse::Err(e.to_string()),
            },
            ProxyRequest::FetchVersion { version, .. } => {
                ProxyResponse::Err(format!("fetch_version_iter not wired to a finder: {version}"))
            }
            ProxyRequest::InstallVersion { version, .. } => match updater.install_version(&version) {
                Ok(()) => ProxyResponse::Ok,
                Err(e) => ProxyResponse::Err(e.to_string()),
            },
            ProxyRequest::UninstallVersion { version, .. } => {
                match updater.uninstall_version(&version) {
                    Ok(()) => ProxyResponse::Ok,
                    Err(e) => ProxyResponse::Err(e.to_string()),
                }
            }
        };
        write_record(&mut stdout_lock, &resp)?;
    }
    Ok(())
}
