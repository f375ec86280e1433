//! Daemon-wide state: active, queued and completed jobs.
//!
//! Only the daemon writes this file. Every write is a full atomic replace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::env::Environment;
use crate::errors::StoreError;
use crate::pipeline::branch::sanitize;
use crate::util::{read_json, write_json_atomic};

/// Longest goal slug used in a goal-based job id.
const GOAL_SLUG_LEN: usize = 32;

/// Hex characters of the goal hash appended to the slug.
const GOAL_HASH_LEN: usize = 8;

/// What a job works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkTarget {
    Issue(u64),
    Goal(String),
}

impl WorkTarget {
    /// Job id for this target: `pipeline-<issue>` or `goal-<slug>-<hash>`.
    ///
    /// The hash covers the full goal text, so goals that slug the same still get
    /// distinct ids.
    pub fn job_id(&self) -> String {
        match self {
            WorkTarget::Issue(n) => format!("pipeline-{}", n),
            WorkTarget::Goal(goal) => {
                let slug: String = sanitize(goal).chars().take(GOAL_SLUG_LEN).collect();
                let slug = slug.trim_end_matches('-');
                let hash = goal_hash(goal);
                if slug.is_empty() {
                    format!("goal-{}", hash)
                } else {
                    format!("goal-{}-{}", slug, hash)
                }
            }
        }
    }

    pub fn issue(&self) -> Option<u64> {
        match self {
            WorkTarget::Issue(n) => Some(*n),
            WorkTarget::Goal(_) => None,
        }
    }
}

fn goal_hash(goal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(goal.as_bytes());
    format!("{:x}", hasher.finalize())[..GOAL_HASH_LEN].to_string()
}

impl std::fmt::Display for WorkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkTarget::Issue(n) => write!(f, "#{}", n),
            WorkTarget::Goal(goal) => write!(f, "\"{}\"", goal),
        }
    }
}

/// An eligible item waiting for a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub target: WorkTarget,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Overrides the daemon's default template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WorkItem {
    pub fn new(target: WorkTarget, title: impl Into<String>) -> Self {
        Self {
            target,
            title: title.into(),
            body: String::new(),
            labels: Vec::new(),
            template: None,
        }
    }

    /// The goal text the stage machine works from.
    pub fn goal(&self) -> String {
        match &self.target {
            WorkTarget::Goal(goal) => goal.clone(),
            WorkTarget::Issue(n) if self.title.is_empty() => format!("Issue {}", n),
            WorkTarget::Issue(_) => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Success,
    Failure,
}

impl std::fmt::Display for JobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobResult::Success => write!(f, "success"),
            JobResult::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub item: WorkItem,
    pub template: String,
    pub branch: String,
    pub status: JobStatus,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    /// Why the job failed without running (spawn failure, lost process)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Mark finished and compute the duration from `started_at`.
    pub fn finish(&mut self, result: JobResult, exit_code: Option<i32>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.exit_code = exit_code;
        self.finished_at = Some(now);
        self.duration_secs = Some((now - self.started_at).num_seconds().max(0));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonState {
    #[serde(default)]
    pub active_jobs: Vec<Job>,
    #[serde(default)]
    pub queued: Vec<WorkItem>,
    /// Most recent last, bounded by `daemon.completed_history`
    #[serde(default)]
    pub completed: Vec<Job>,
    /// Job id to title
    #[serde(default)]
    pub titles: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,
    /// Admission stopped by the failure breaker
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl DaemonState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            active_jobs: Vec::new(),
            queued: Vec::new(),
            completed: Vec::new(),
            titles: BTreeMap::new(),
            started_at: now,
            last_poll: None,
            paused: false,
            consecutive_failures: 0,
        }
    }

    pub fn load(env: &Environment) -> Result<Self, StoreError> {
        read_json(&env.paths.daemon_state_file(), "daemon state", "daemon-state.json")
    }

    /// The persisted state, or a fresh one if none exists yet.
    pub fn load_or_new(env: &Environment) -> Result<Self, StoreError> {
        match Self::load(env) {
            Ok(state) => Ok(state),
            Err(e) if e.is_not_found() => Ok(Self::new(env.now())),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, env: &Environment) -> Result<(), StoreError> {
        write_json_atomic(&env.paths.daemon_state_file(), self)
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn is_active(&self, target: &WorkTarget) -> bool {
        self.active_jobs.iter().any(|j| j.item.target == *target)
    }

    pub fn is_queued(&self, target: &WorkTarget) -> bool {
        self.queued.iter().any(|q| q.target == *target)
    }

    pub fn is_completed(&self, target: &WorkTarget) -> bool {
        self.completed.iter().any(|j| j.item.target == *target)
    }

    /// Whether the target is in any of the three collections.
    pub fn is_known(&self, target: &WorkTarget) -> bool {
        self.is_active(target) || self.is_queued(target) || self.is_completed(target)
    }

    /// Append to history, dropping the oldest entries beyond `limit`.
    pub fn push_completed(&mut self, job: Job, limit: usize) {
        self.completed.push(job);
        if self.completed.len() > limit {
            let excess = self.completed.len() - limit;
            self.completed.drain(..excess);
        }
    }

    /// Remove a target from history so it can be admitted again. Returns whether it was there.
    pub fn forget_completed(&mut self, target: &WorkTarget) -> bool {
        let before = self.completed.len();
        self.completed.retain(|j| j.item.target != *target);
        before != self.completed.len()
    }

    pub fn take_active(&mut self, job_id: &str) -> Option<Job> {
        let idx = self.active_jobs.iter().position(|j| j.id == job_id)?;
        Some(self.active_jobs.remove(idx))
    }
}
