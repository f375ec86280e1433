//! Launching one executor process per admitted job.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use super::state::{Job, WorkTarget};
use crate::env::Paths;
use crate::errors::SchedulerError;
use crate::tracker::GitTracker;

/// How a worker process ended. `code` is `None` when it was killed by a signal
/// or its exit status is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running executor the scheduler can poll without blocking.
pub trait Worker: Send {
    fn pid(&self) -> Option<u32>;
    fn try_exit(&mut self) -> std::io::Result<Option<WorkerExit>>;
}

pub struct Spawned {
    pub worker: Box<dyn Worker>,
    pub worktree_path: PathBuf,
    pub log_path: PathBuf,
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, job: &Job) -> Result<Spawned, SchedulerError>;
}

struct ProcessWorker {
    child: Child,
}

impl Worker for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> std::io::Result<Option<WorkerExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| WorkerExit { code: status.code() }))
    }
}

/// Re-invokes the convoy binary as `convoy start` for each job, optionally in
/// its own git worktree, with stdout and stderr appended to the job log.
pub struct ProcessSpawner {
    exe: PathBuf,
    repo_dir: PathBuf,
    paths: Paths,
    use_worktrees: bool,
}

impl ProcessSpawner {
    pub fn new(exe: impl Into<PathBuf>, repo_dir: impl Into<PathBuf>, paths: Paths) -> Self {
        Self {
            exe: exe.into(),
            repo_dir: repo_dir.into(),
            paths,
            use_worktrees: true,
        }
    }

    pub fn with_worktrees(mut self, enabled: bool) -> Self {
        self.use_worktrees = enabled;
        self
    }

    /// Directory the job runs in, and whether other jobs share it.
    /// Creates the worktree on first use.
    fn prepare_workdir(&self, job: &Job) -> Result<(PathBuf, bool), SchedulerError> {
        if !self.use_worktrees {
            return Ok((self.repo_dir.clone(), true));
        }
        if !GitTracker::is_repo(&self.repo_dir) {
            tracing::warn!(
                job_id = %job.id,
                dir = %self.repo_dir.display(),
                "not a git repository; running without a worktree"
            );
            return Ok((self.repo_dir.clone(), true));
        }
        let path = self.paths.worktrees_dir().join(&job.id);
        if !path.exists() {
            GitTracker::new(&self.repo_dir)
                .and_then(|tracker| tracker.add_worktree(&job.id, &path, &job.branch))
                .with_context(|| format!("Failed to create worktree for {}", job.id))?;
            tracing::info!(job_id = %job.id, path = %path.display(), branch = %job.branch, "created worktree");
        }
        Ok((path, false))
    }

    /// Drop checkpoints and iteration history left by an earlier attempt so an
    /// admitted job starts its stages with a full iteration budget.
    /// Stage completion in the pipeline state survives.
    fn reset_run_state(&self, job: &Job, workdir: &Path, shared: bool) -> Result<(), SchedulerError> {
        let mut paths = Paths::new(&self.paths.home, workdir);
        if shared {
            paths = paths.scoped(&job.id);
        }
        for dir in [paths.checkpoint_dir(), paths.history_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => tracing::debug!(job_id = %job.id, dir = %dir.display(), "cleared earlier run state"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(SchedulerError::SpawnFailed {
                        job_id: job.id.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn open_log(&self, job_id: &str) -> Result<(PathBuf, std::fs::File), SchedulerError> {
        let path = self.paths.job_log_file(job_id);
        let spawn_err = |source| SchedulerError::SpawnFailed {
            job_id: job_id.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(spawn_err)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(spawn_err)?;
        Ok((path, file))
    }

    fn command(&self, job: &Job, workdir: &Path, shared: bool) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("start")
            .arg("--job-id")
            .arg(&job.id)
            .arg("--pipeline")
            .arg(&job.template)
            .arg("--goal")
            .arg(job.item.goal())
            .arg("--home")
            .arg(&self.paths.home)
            .arg("--project-dir")
            .arg(workdir);
        if shared {
            cmd.arg("--job-scope").arg(&job.id);
        }
        if let WorkTarget::Issue(n) = job.item.target {
            cmd.arg("--issue").arg(n.to_string());
        }
        if !job.item.labels.is_empty() {
            cmd.arg("--labels").arg(job.item.labels.join(","));
        }
        cmd.current_dir(workdir).stdin(Stdio::null());
        cmd
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, job: &Job) -> Result<Spawned, SchedulerError> {
        let (workdir, shared) = self.prepare_workdir(job)?;
        self.reset_run_state(job, &workdir, shared)?;
        let (log_path, log) = self.open_log(&job.id)?;
        let spawn_err = |source| SchedulerError::SpawnFailed {
            job_id: job.id.clone(),
            source,
        };
        let stderr = log.try_clone().map_err(spawn_err)?;

        let child = self
            .command(job, &workdir, shared)
            .stdout(log)
            .stderr(stderr)
            .spawn()
            .map_err(spawn_err)?;
        tracing::info!(job_id = %job.id, pid = ?child.id(), "spawned executor");

        Ok(Spawned {
            worker: Box::new(ProcessWorker { child }),
            worktree_path: workdir,
            log_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::state::{JobStatus, WorkItem};
    use crate::tracker::git::test_support::{commit_file, init_repo};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn job(target: WorkTarget) -> Job {
        Job {
            id: target.job_id(),
            item: WorkItem::new(target, "Add retries"),
            template: "fast".into(),
            branch: "fix/add-retries".into(),
            status: JobStatus::Active,
            worktree_path: None,
            log_path: None,
            pid: None,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            exit_code: None,
            duration_secs: None,
            error: None,
        }
    }

    async fn wait_exit(worker: &mut Box<dyn Worker>) -> WorkerExit {
        for _ in 0..200 {
            if let Some(exit) = worker.try_exit().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker did not exit");
    }

    #[tokio::test]
    async fn output_goes_to_job_log() {
        let home = tempdir().unwrap();
        let repo = tempdir().unwrap();
        // `echo` stands in for the convoy binary and prints its arguments
        let spawner = ProcessSpawner::new("echo", repo.path(), Paths::new(home.path(), repo.path()))
            .with_worktrees(false);
        let mut spawned = spawner.spawn(&job(WorkTarget::Issue(9))).unwrap();
        assert!(spawned.worker.pid().is_some());
        assert!(wait_exit(&mut spawned.worker).await.success());

        let log = std::fs::read_to_string(&spawned.log_path).unwrap();
        assert!(log.starts_with("start --job-id pipeline-9 --pipeline fast --goal Add retries"));
        assert!(log.contains("--issue 9"));
        // the checkout is shared, so the job's run state is scoped to it
        assert!(log.contains("--job-scope pipeline-9"));
        assert_eq!(spawned.worktree_path, repo.path());
    }

    #[tokio::test]
    async fn readmit_clears_exhausted_checkpoint() {
        let home = tempdir().unwrap();
        let repo = tempdir().unwrap();
        let paths = Paths::new(home.path(), repo.path()).scoped("pipeline-3");
        std::fs::create_dir_all(paths.checkpoint_dir()).unwrap();
        std::fs::write(paths.checkpoint_dir().join("build.json"), "{}").unwrap();
        std::fs::create_dir_all(paths.history_dir()).unwrap();
        std::fs::write(paths.history_dir().join("build.json"), "[]").unwrap();
        std::fs::write(paths.pipeline_state_file(), "---\n").unwrap();
        // another job's checkpoint in the same checkout is untouched
        let other = Paths::new(home.path(), repo.path()).scoped("pipeline-4");
        std::fs::create_dir_all(other.checkpoint_dir()).unwrap();
        std::fs::write(other.checkpoint_dir().join("build.json"), "{}").unwrap();

        let spawner = ProcessSpawner::new("true", repo.path(), Paths::new(home.path(), repo.path()))
            .with_worktrees(false);
        let mut spawned = spawner.spawn(&job(WorkTarget::Issue(3))).unwrap();
        wait_exit(&mut spawned.worker).await;

        assert!(!paths.checkpoint_dir().exists());
        assert!(!paths.history_dir().exists());
        assert!(paths.pipeline_state_file().exists());
        assert!(other.checkpoint_dir().join("build.json").exists());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let home = tempdir().unwrap();
        let spawner = ProcessSpawner::new(
            home.path().join("no-such-binary"),
            home.path(),
            Paths::new(home.path(), home.path()),
        );
        let err = spawner.spawn(&job(WorkTarget::Issue(1))).err().unwrap();
        assert!(matches!(err, SchedulerError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn creates_worktree_on_job_branch() {
        let home = tempdir().unwrap();
        let repo = tempdir().unwrap();
        init_repo(repo.path());
        commit_file(repo.path(), "README.md", "hi\n", "init");

        let spawner = ProcessSpawner::new("true", repo.path(), Paths::new(home.path(), repo.path()));
        let mut spawned = spawner.spawn(&job(WorkTarget::Issue(4))).unwrap();
        wait_exit(&mut spawned.worker).await;

        let wt = home.path().join("worktrees/pipeline-4");
        assert_eq!(spawned.worktree_path, wt);
        assert!(wt.join("README.md").exists());
        let tracker = GitTracker::new(&wt).unwrap();
        assert_eq!(tracker.current_branch().as_deref(), Some("fix/add-retries"));
    }

    #[tokio::test]
    async fn worktree_needs_a_commit() {
        let home = tempdir().unwrap();
        let repo = tempdir().unwrap();
        init_repo(repo.path());
        let spawner = ProcessSpawner::new("true", repo.path(), Paths::new(home.path(), repo.path()));
        assert!(matches!(
            spawner.spawn(&job(WorkTarget::Issue(4))).err().unwrap(),
            SchedulerError::Other(_)
        ));
    }
}
