//! Detaching from the controlling terminal.
//!
//! [`daemonise`] returns a [`Daemon`] guard; dropping it removes the pid file.
//! Must run before any thread is spawned.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, Pid, chdir, fork, setsid};

/// True when a service manager already supervises us; forking would only
/// confuse it.
pub fn need_foreground() -> bool {
    supervised_by_service_manager(|key| std::env::var_os(key))
}

fn supervised_by_service_manager(var: impl Fn(&str) -> Option<OsString>) -> bool {
    ["INVOCATION_ID", "NOTIFY_SOCKET"]
        .into_iter()
        .any(|key| var(key).is_some())
}

/// Held for the lifetime of a detached daemon.
#[derive(Debug)]
pub struct Daemon {
    _pid_file: PidFile,
}

/// Double‑fork, start a new session, point stdio at `log_file` (or
/// `/dev/null`) and take the pid file. The original process exits 0.
pub fn daemonise(pid_file: &Path, log_file: Option<&Path>) -> Result<Daemon> {
    // Fail while we still have a terminal to complain on.
    let mut guard = PidFile::new(pid_file);
    guard.check_free()?;

    // SAFETY: called from main before any other thread exists.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid failed")?;
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    chdir("/").context("chdir / failed")?;
    umask(Mode::from_bits_truncate(0o027));
    redirect_stdio(log_file)?;

    guard.acquire()?;
    info!("detached as pid {}", std::process::id());
    Ok(Daemon { _pid_file: guard })
}

fn redirect_stdio(log_file: Option<&Path>) -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?;
    let out = match log_file {
        Some(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?,
        None => null.try_clone().context("cannot duplicate /dev/null")?,
    };

    dup_onto(null.as_raw_fd(), libc::STDIN_FILENO)?;
    dup_onto(out.as_raw_fd(), libc::STDOUT_FILENO)?;
    dup_onto(out.as_raw_fd(), libc::STDERR_FILENO)?;
    Ok(())
}

fn dup_onto(src: i32, dst: i32) -> Result<()> {
    // SAFETY: both descriptors are open; dup2 closes `dst` atomically.
    if unsafe { libc::dup2(src, dst) } < 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("dup2({src}, {dst}) failed"));
    }
    Ok(())
}

/// Pid file removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    acquired: bool,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            acquired: false,
        }
    }

    /// Error out if a live process holds the file; clear it if stale.
    pub fn check_free(&self) -> Result<()> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Ok(());
        };
        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 && is_alive(pid) => {
                anyhow::bail!(
                    "procwatch already running (pid {pid}, pid file {})",
                    self.path.display()
                )
            }
            _ => {
                warn!("removing stale pid file {}", self.path.display());
                std::fs::remove_file(&self.path)
                    .with_context(|| format!("cannot remove {}", self.path.display()))
            }
        }
    }

    pub fn acquire(&mut self) -> Result<()> {
        self.check_free()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        std::fs::write(&self.path, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {}", self.path.display()))?;
        self.acquired = true;
        debug!("pid file {} acquired", self.path.display());
        Ok(())
    }

    pub fn release(&mut self) {
        if !std::mem::take(&mut self.acquired) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("pid file {} released", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove pid file {}: {e}", self.path.display()),
        }
    }
}

fn is_alive(pid: i32) -> bool {
    // EPERM: it exists, it just is not ours.
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}
