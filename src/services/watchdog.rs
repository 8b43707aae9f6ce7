//! Crash-safety net for staged files.
//!
//! The watchdog runs as its own session, polls the stager's process for
//! liveness and, once that process is gone (or the watchdog receives
//! SIGTERM), removes every `tcf_*` file left in the staging directory.
//!
//! Liveness detection is best effort: `kill(pid, 0)` is polled at a fixed
//! interval, so cleanup happens up to one interval after the parent died,
//! and a recycled pid keeps the watchdog waiting.

use crate::error::{Result, StagerError};
use crate::utils::path::{STAGED_FILE_PREFIX, is_log_file};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WatchdogArgs {
    pub parent_pid: u32,
    pub tmpdir: PathBuf,
    pub base_tmpdir: PathBuf,
    pub keep_logfiles: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    ParentGone,
    Terminated,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub removed_dir: bool,
}

/// Whether `pid` still exists. EPERM counts as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the existence check only.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Polls the parent until it disappears or SIGTERM arrives.
pub async fn wait_for_parent(parent_pid: u32, interval: Duration) -> WakeReason {
    #[cfg(unix)]
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        #[cfg(unix)]
        let terminated = async {
            match sigterm.as_mut() {
                Some(s) => {
                    s.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            _ = terminated => {
                tracing::info!("💤 SIGTERM received");
                return WakeReason::Terminated;
            }
            _ = ticker.tick() => {
                if !is_pid_alive(parent_pid) {
                    tracing::info!("Monitored process {} is gone", parent_pid);
                    return WakeReason::ParentGone;
                }
            }
        }
    }
}

/// Removes orphaned staging files from `tmpdir`, then `tmpdir` itself unless
/// it is the shared base directory. Failures are logged, never returned.
pub async fn cleanup_staging_dir(
    tmpdir: &Path,
    base_tmpdir: &Path,
    keep_logfiles: bool,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    match tokio::fs::read_dir(tmpdir).await {
        Ok(mut entries) => loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read {}: {}", tmpdir.display(), e);
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(STAGED_FILE_PREFIX) {
                continue;
            }
            let path = entry.path();
            if keep_logfiles && is_log_file(&name) {
                report.kept.push(path);
                continue;
            }
            tracing::info!("🧹 Removing: {}", path.display());
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed.push(path),
                Err(e) => tracing::error!("Failed to remove {}: {}", path.display(), e),
            }
        },
        Err(e) => {
            tracing::warn!("Cannot open staging directory {}: {}", tmpdir.display(), e);
        }
    }

    if tmpdir != base_tmpdir {
        match tokio::fs::remove_dir(tmpdir).await {
            Ok(()) => report.removed_dir = true,
            Err(e) => tracing::debug!("Keeping directory {}: {}", tmpdir.display(), e),
        }
    }

    report
}

/// Full watchdog lifecycle: wait, then clean up.
pub async fn run_watchdog(args: &WatchdogArgs) -> CleanupReport {
    tracing::info!(
        "🐕 Watchdog monitoring pid {} for {}",
        args.parent_pid,
        args.tmpdir.display()
    );
    let reason = wait_for_parent(args.parent_pid, args.interval).await;
    tracing::debug!("Watchdog woke up: {:?}", reason);
    let report = cleanup_staging_dir(&args.tmpdir, &args.base_tmpdir, args.keep_logfiles).await;
    tracing::info!(
        "✅ Watchdog cleanup removed {} files, kept {}",
        report.removed.len(),
        report.kept.len()
    );
    report
}

/// Launches `command` detached in its own session so that it survives
/// (and is not signalled together with) the calling process.
///
/// Command line: `<command> <parent_pid> <tmpdir> <base_tmpdir> <0|1>`.
pub fn spawn_watchdog(command: &str, args: &WatchdogArgs) -> Result<u32> {
    let mut cmd = Command::new(command);
    cmd.arg(args.parent_pid.to_string())
        .arg(&args.tmpdir)
        .arg(&args.base_tmpdir)
        .arg(if args.keep_logfiles { "1" } else { "0" });
    if args.interval != DEFAULT_POLL_INTERVAL {
        cmd.arg("--interval-secs")
            .arg(args.interval.as_secs().max(1).to_string());
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    #[cfg(unix)]
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| StagerError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    // Dropping the handle leaves the process running; tokio reaps it if it
    // exits before we do.
    drop(child);
    Ok(pid)
}
