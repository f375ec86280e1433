//! Injected environment: filesystem layout and clock.
//!
//! Components never read ambient globals (home directory, wall clock) directly.
//! They receive an [`Environment`] so tests can point everything at a temp dir
//! and drive time by hand.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Name of the per-workspace state directory.
pub const WORKSPACE_DIR: &str = ".convoy";

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Filesystem layout.
///
/// `home` is shared between the daemon and every executor it spawns;
/// `workspace` is the job's checkout. When several jobs share one checkout,
/// `scope` names the job and its run state moves under `.convoy/jobs/<scope>/`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
    pub workspace: PathBuf,
    pub scope: Option<String>,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            workspace: workspace.into(),
            scope: None,
        }
    }

    /// Keep this job's run state apart from other jobs in the same workspace.
    pub fn scoped(mut self, job_id: impl Into<String>) -> Self {
        self.scope = Some(job_id.into());
        self
    }

    /// Resolve the shared home: explicit value, then `CONVOY_HOME`, then `~/.convoy`.
    pub fn resolve_home(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(env_home) = std::env::var("CONVOY_HOME")
            && !env_home.is_empty()
        {
            return PathBuf::from(env_home);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(WORKSPACE_DIR)
    }

    // Shared (home) layout

    pub fn daemon_state_file(&self) -> PathBuf {
        self.home.join("daemon-state.json")
    }

    pub fn daemon_lock_file(&self) -> PathBuf {
        self.home.join("daemon.lock")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.home.join("daemon.pid")
    }

    pub fn heartbeat_dir(&self) -> PathBuf {
        self.home.join("heartbeats")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn job_log_file(&self, job_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", job_id))
    }

    pub fn home_templates_dir(&self) -> PathBuf {
        self.home.join("templates")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.home.join("control")
    }

    pub fn resume_marker(&self) -> PathBuf {
        self.control_dir().join("resume")
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.control_dir().join("requests")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.home.join("worktrees")
    }

    // Per-job (workspace) layout

    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace.join(WORKSPACE_DIR)
    }

    /// Run state for one job: the workspace dir itself, or `jobs/<scope>` under it.
    pub fn state_dir(&self) -> PathBuf {
        match &self.scope {
            Some(job_id) => self.workspace_dir().join("jobs").join(job_id),
            None => self.workspace_dir(),
        }
    }

    pub fn pipeline_state_file(&self) -> PathBuf {
        self.state_dir().join("pipeline-state.md")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir().join("checkpoints")
    }

    pub fn intervention_dir(&self) -> PathBuf {
        self.state_dir().join("intervention")
    }

    pub fn quality_dir(&self) -> PathBuf {
        self.state_dir().join("quality")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.state_dir().join("history")
    }

    pub fn workspace_templates_dir(&self) -> PathBuf {
        self.workspace_dir().join("templates")
    }

    /// Goal checklist written by the plan stage.
    pub fn plan_file(&self) -> PathBuf {
        self.workspace_dir().join("plan.md")
    }
}

/// Everything a component needs from the outside world.
#[derive(Clone)]
pub struct Environment {
    pub paths: Paths,
    pub clock: Arc<dyn Clock>,
}

impl Environment {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(paths: Paths, clock: Arc<dyn Clock>) -> Self {
        Self { paths, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}
