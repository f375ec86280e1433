//! The job scheduler: poll, admit, spawn, reap.
//!
//! One cooperative loop owns [`DaemonState`]. Parallelism comes from the
//! executor processes it spawns, one per active job. Operators never write
//! the state file; they drop control files that the next cycle applies.

pub mod daemon;
pub mod source;
pub mod spawner;
pub mod state;

pub use source::{CommandWorkSource, WorkSource};
pub use spawner::{ProcessSpawner, Spawned, Spawner, Worker, WorkerExit};
pub use state::{DaemonState, Job, JobResult, JobStatus, WorkItem, WorkTarget};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConvoyToml;
use crate::env::{Environment, Paths};
use crate::errors::{SchedulerError, StoreError};
use crate::heartbeat::HeartbeatRecorder;
use crate::pipeline::branch::{branch_name, default_prefix};
use crate::process::pid_exists;
use crate::util::{read_json, remove_if_exists, write_json_atomic};

/// An operator's request to (re)admit one item, dropped into `control/requests/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub item: WorkItem,
}

impl EnqueueRequest {
    /// Write the request file; the daemon picks it up on its next cycle.
    pub fn submit(&self, paths: &Paths) -> Result<std::path::PathBuf, StoreError> {
        let path = paths
            .requests_dir()
            .join(format!("{}.json", uuid::Uuid::new_v4()));
        write_json_atomic(&path, self)?;
        Ok(path)
    }
}

/// Ask a running daemon to lift the failure breaker.
pub fn request_resume(paths: &Paths) -> Result<(), StoreError> {
    crate::util::write_atomic(&paths.resume_marker(), b"")
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub polled: usize,
    pub admitted: Vec<String>,
    pub reaped: Vec<Job>,
}

pub struct Scheduler {
    env: Environment,
    config: ConvoyToml,
    source: Arc<dyn WorkSource>,
    spawner: Arc<dyn Spawner>,
    heartbeats: HeartbeatRecorder,
    state: DaemonState,
    workers: HashMap<String, Box<dyn Worker>>,
}

impl Scheduler {
    /// Load persisted state. Jobs left active by a previous daemon have no
    /// child handle and are reaped by PID liveness.
    pub fn new(
        env: Environment,
        config: ConvoyToml,
        source: Arc<dyn WorkSource>,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self, SchedulerError> {
        let state = DaemonState::load_or_new(&env)?;
        if !state.active_jobs.is_empty() {
            tracing::info!(active = state.active_jobs.len(), "recovered active jobs from previous daemon");
        }
        Ok(Self {
            heartbeats: HeartbeatRecorder::new(&env),
            env,
            config,
            source,
            spawner,
            state,
            workers: HashMap::new(),
        })
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    fn max_concurrent(&self) -> usize {
        self.config.daemon.max_concurrent_pipelines
    }

    pub fn save(&self) -> Result<(), SchedulerError> {
        self.state.save(&self.env)?;
        Ok(())
    }

    /// One full cycle: control files, poll, admit, reap, persist.
    pub async fn tick(&mut self) -> Result<TickSummary, SchedulerError> {
        let mut summary = TickSummary::default();
        self.apply_control()?;

        match self.poll().await {
            Ok(n) => summary.polled = n,
            Err(e) => tracing::warn!(error = %e, "poll failed"),
        }

        match self.admit() {
            Ok(ids) => summary.admitted = ids,
            Err(SchedulerError::Paused { failures }) => {
                tracing::warn!(failures, queued = self.state.queued.len(), "admission paused");
            }
            Err(e) => return Err(e),
        }

        summary.reaped = self.reap()?;
        self.save()?;
        Ok(summary)
    }

    /// Apply the resume marker and any enqueue requests.
    pub fn apply_control(&mut self) -> Result<(), SchedulerError> {
        let resume = self.env.paths.resume_marker();
        if remove_if_exists(&resume)? {
            tracing::info!(
                failures = self.state.consecutive_failures,
                "admission resumed by operator"
            );
            self.state.paused = false;
            self.state.consecutive_failures = 0;
        }

        let pattern = self
            .env
            .paths
            .requests_dir()
            .join("*.json")
            .to_string_lossy()
            .to_string();
        let mut requests: Vec<_> = glob::glob(&pattern)
            .map(|paths| paths.filter_map(|p| p.ok()).collect())
            .unwrap_or_default();
        requests.sort();

        for path in requests {
            match read_json::<EnqueueRequest>(&path, "enqueue request", &path.to_string_lossy()) {
                Ok(request) => self.enqueue(request.item),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "dropping malformed enqueue request"),
            }
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    /// Queue an item explicitly, forgetting any completed run of it.
    pub fn enqueue(&mut self, item: WorkItem) {
        if self.state.is_active(&item.target) || self.state.is_queued(&item.target) {
            tracing::info!(work = %item.target, "already active or queued");
            return;
        }
        if self.state.forget_completed(&item.target) {
            tracing::info!(work = %item.target, "re-admitting previously completed work");
        }
        tracing::info!(work = %item.target, "queued by operator");
        self.state.titles.insert(item.target.job_id(), item.title.clone());
        self.state.queued.push(item);
    }

    /// Merge newly eligible items into the queue. Returns how many were added.
    pub async fn poll(&mut self) -> Result<usize, SchedulerError> {
        let items = self.source.fetch().await?;
        self.state.last_poll = Some(self.env.now());
        let mut added = 0;
        for item in items {
            if self.state.is_known(&item.target) {
                continue;
            }
            tracing::debug!(work = %item.target, title = %item.title, "new work item");
            self.state.titles.insert(item.target.job_id(), item.title.clone());
            self.state.queued.push(item);
            added += 1;
        }
        if added > 0 {
            tracing::info!(added, queued = self.state.queued.len(), "polled work source");
        }
        Ok(added)
    }

    /// Admit queued items while below the concurrency cap. Returns the ids spawned.
    pub fn admit(&mut self) -> Result<Vec<String>, SchedulerError> {
        let mut admitted = Vec::new();
        while !self.state.queued.is_empty() {
            let queued = self.state.queued.len();
            match self.admit_next() {
                Ok(Some(id)) => admitted.push(id),
                // everything left shares an id with a running job
                Ok(None) if self.state.queued.len() == queued => break,
                Ok(None) => {}
                Err(SchedulerError::ConcurrencyLimit { .. }) => break,
                Err(SchedulerError::Paused { failures }) if !admitted.is_empty() => {
                    tracing::warn!(failures, "breaker tripped during admission");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(admitted)
    }

    /// Pop the first queued item whose job id is not already running and spawn it.
    ///
    /// Returns `Ok(None)` when the spawn failed (the job is recorded as a failure)
    /// or when every queued item waits on a running job with the same id.
    pub fn admit_next(&mut self) -> Result<Option<String>, SchedulerError> {
        if self.state.paused {
            return Err(SchedulerError::Paused {
                failures: self.state.consecutive_failures,
            });
        }
        if self.state.active_count() >= self.max_concurrent() {
            return Err(SchedulerError::ConcurrencyLimit {
                max: self.max_concurrent(),
            });
        }
        let Some(idx) = self.state.queued.iter().position(|q| {
            let id = q.target.job_id();
            !self.state.active_jobs.iter().any(|j| j.id == id) && !self.workers.contains_key(&id)
        }) else {
            if !self.state.queued.is_empty() {
                tracing::debug!(queued = self.state.queued.len(), "queued work waits on running jobs with the same id");
            }
            return Ok(None);
        };
        let item = self.state.queued.remove(idx);
        let job = self.new_job(item);
        Ok(self.spawn(job))
    }

    fn new_job(&self, item: WorkItem) -> Job {
        let id = item.target.job_id();
        let prefix = default_prefix(self.config.pipeline.branch_prefix.as_deref(), &item.labels);
        Job {
            branch: branch_name(&prefix, &item.goal(), &id),
            template: item
                .template
                .clone()
                .unwrap_or_else(|| self.config.daemon.default_template.clone()),
            id,
            item,
            status: JobStatus::Active,
            worktree_path: None,
            log_path: None,
            pid: None,
            started_at: self.env.now(),
            finished_at: None,
            result: None,
            exit_code: None,
            duration_secs: None,
            error: None,
        }
    }

    fn spawn(&mut self, mut job: Job) -> Option<String> {
        match self.spawner.spawn(&job) {
            Ok(spawned) => {
                job.pid = spawned.worker.pid();
                job.worktree_path = Some(spawned.worktree_path);
                job.log_path = Some(spawned.log_path);
                tracing::info!(job_id = %job.id, pid = ?job.pid, template = %job.template, "admitted job");
                let id = job.id.clone();
                self.workers.insert(id.clone(), spawned.worker);
                self.state.active_jobs.push(job);
                Some(id)
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "spawn failed");
                job.error = Some(e.to_string());
                job.finish(JobResult::Failure, None, self.env.now());
                self.record_result(job);
                None
            }
        }
    }

    /// Collect exited workers into history and release their slots.
    pub fn reap(&mut self) -> Result<Vec<Job>, SchedulerError> {
        let timeout = self.config.pipeline.heartbeat_timeout_secs;
        let mut exited: Vec<(String, Option<i32>, Option<String>)> = Vec::new();

        for job in &self.state.active_jobs {
            match self.workers.get_mut(&job.id) {
                Some(worker) => match worker.try_exit() {
                    Ok(Some(exit)) => exited.push((job.id.clone(), exit.code, None)),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "could not poll worker");
                    }
                },
                None => {
                    if !job.pid.is_some_and(pid_exists) {
                        exited.push((
                            job.id.clone(),
                            None,
                            Some("executor exited while the daemon was not watching".into()),
                        ));
                    }
                }
            }
        }

        // Hung but alive workers are only flagged
        for job in &self.state.active_jobs {
            if exited.iter().any(|(id, _, _)| *id == job.id) {
                continue;
            }
            if let Err(StoreError::StaleWorker { age_secs, .. }) = self.heartbeats.check(&job.id, timeout) {
                tracing::warn!(job_id = %job.id, age_secs, timeout_secs = timeout, "worker heartbeat is stale");
            }
        }

        let mut reaped = Vec::new();
        for (id, code, error) in exited {
            self.workers.remove(&id);
            let Some(mut job) = self.state.take_active(&id) else {
                continue;
            };
            let result = if code == Some(0) {
                JobResult::Success
            } else {
                JobResult::Failure
            };
            job.finish(result, code, self.env.now());
            job.error = error;
            match self.heartbeats.clear(&id) {
                Ok(true) => tracing::debug!(job_id = %id, "cleared leftover heartbeat"),
                Ok(false) => {}
                // the job is already out of active_jobs; history must still get it
                Err(e) => tracing::warn!(job_id = %id, error = %e, "could not clear heartbeat"),
            }
            tracing::info!(job_id = %id, result = %result, exit_code = ?code, duration_secs = ?job.duration_secs, "reaped job");
            reaped.push(job.clone());
            self.record_result(job);
        }
        Ok(reaped)
    }

    /// Move a finished job into history and update the failure breaker.
    fn record_result(&mut self, job: Job) {
        match job.result {
            Some(JobResult::Success) => self.state.consecutive_failures = 0,
            _ => {
                self.state.consecutive_failures += 1;
                let max = self.config.daemon.max_consecutive_failures;
                if !self.state.paused && self.state.consecutive_failures >= max {
                    self.state.paused = true;
                    tracing::error!(
                        failures = self.state.consecutive_failures,
                        "too many consecutive failures; admission paused until `convoy daemon resume`"
                    );
                }
            }
        }
        let limit = self.config.daemon.completed_history;
        self.state.push_completed(job, limit);
    }
}
