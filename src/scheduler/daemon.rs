//! The long-running daemon around [`Scheduler`]: single-instance lock, pid
//! file, the timed loop and signal handling.

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};

use super::Scheduler;
use crate::env::Paths;
use crate::process::{pid_exists, terminate};

/// Held for the daemon's lifetime. Dropping it removes the pid file.
pub struct DaemonLock {
    _file: File,
    pid_path: PathBuf,
}

impl DaemonLock {
    /// Take the exclusive lock, refusing to run next to another daemon.
    pub fn acquire(paths: &Paths) -> Result<Self> {
        std::fs::create_dir_all(&paths.home)
            .with_context(|| format!("Failed to create {}", paths.home.display()))?;
        let lock_path = paths.daemon_lock_file();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;
        if file.try_lock_exclusive().is_err() {
            let holder = running_pid(paths)
                .map(|pid| format!(" (pid {})", pid))
                .unwrap_or_default();
            bail!("Another convoy daemon is already running{}", holder);
        }

        let pid_path = paths.daemon_pid_file();
        let mut pid_file = File::create(&pid_path)
            .with_context(|| format!("Failed to write {}", pid_path.display()))?;
        writeln!(pid_file, "{}", std::process::id())?;

        Ok(Self {
            _file: file,
            pid_path,
        })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

/// PID of a live daemon, if its pid file points at one.
pub fn running_pid(paths: &Paths) -> Option<u32> {
    let content = std::fs::read_to_string(paths.daemon_pid_file()).ok()?;
    let pid = content.trim().parse::<u32>().ok()?;
    pid_exists(pid).then_some(pid)
}

/// Send SIGTERM to the running daemon. Returns its pid.
pub fn stop(paths: &Paths) -> Result<u32> {
    let Some(pid) = running_pid(paths) else {
        bail!("No convoy daemon is running");
    };
    terminate(pid).with_context(|| format!("Failed to signal daemon pid {}", pid))?;
    Ok(pid)
}

/// Run cycles until SIGINT/SIGTERM (or after one cycle with `once`).
///
/// A signal that arrives mid-cycle takes effect once the cycle finishes.
pub async fn run(scheduler: &mut Scheduler, interval: Duration, once: bool) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tracing::info!(pid = std::process::id(), interval_secs = interval.as_secs(), "daemon started");
    loop {
        match scheduler.tick().await {
            Ok(summary) => tracing::debug!(
                polled = summary.polled,
                admitted = summary.admitted.len(),
                reaped = summary.reaped.len(),
                active = scheduler.state().active_count(),
                "cycle complete"
            ),
            Err(e) => tracing::error!(error = %e, "cycle failed"),
        }
        if once {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = interrupt.recv() => {
                tracing::info!("received SIGINT");
                break;
            }
            _ = terminate.recv() => {
                tracing::info!("received SIGTERM");
                break;
            }
        }
    }
    scheduler.save().context("Failed to save daemon state on shutdown")?;
    tracing::info!(active = scheduler.state().active_count(), "daemon stopped");
    Ok(())
}
