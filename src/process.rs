//! OS process checks: liveness and resource usage by PID.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::Mutex;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

/// Whether a process with this PID currently exists.
///
/// `EPERM` means the process exists but belongs to someone else, which still counts.
pub fn pid_exists(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send SIGTERM to `pid`.
pub fn terminate(pid: u32) -> std::io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    }
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
}

/// Resident memory (MB) and CPU percentage of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_pct: f64,
}

/// Samples per-process memory and CPU through `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the first sample of
/// a PID reports 0%. Keep one sampler alive across heartbeats.
#[derive(Default)]
pub struct ResourceSampler {
    system: Mutex<System>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage of `pid`; a dead or unknown PID yields zeros.
    pub fn sample(&self, pid: u32) -> ResourceUsage {
        let Ok(mut system) = self.system.lock() else {
            return ResourceUsage::default();
        };
        let pid = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => ResourceUsage {
                memory_mb: (process.memory() as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0,
                cpu_pct: f64::from(process.cpu_usage()),
            },
            None => ResourceUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_exists() {
        assert!(pid_exists(std::process::id()));
    }

    #[test]
    fn zero_and_out_of_range_pids_do_not_exist() {
        assert!(!pid_exists(0));
        assert!(!pid_exists(u32::MAX));
    }

    #[test]
    fn samples_own_memory() {
        let sampler = ResourceSampler::new();
        let usage = sampler.sample(std::process::id());
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_pct >= 0.0);
    }

    #[test]
    fn dead_pid_samples_zero() {
        let sampler = ResourceSampler::new();
        assert_eq!(sampler.sample(u32::MAX - 1), ResourceUsage::default());
    }
}
