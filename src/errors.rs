//! Typed error hierarchy for convoy.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError`: persisted records (heartbeats, checkpoints, state files)
//! - `PipelineError`: stage state machine and quality gate failures
//! - `SchedulerError`: daemon admission, spawning and reaping

use std::path::PathBuf;
use thiserror::Error;

/// Errors reading or writing persisted records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Invalid {kind} key '{key}': use letters, digits, '-', '_' or '.'")]
    InvalidKey { kind: &'static str, key: String },

    #[error("Heartbeat for {job_id} is stale ({age_secs}s old, timeout {timeout_secs}s)")]
    StaleWorker {
        job_id: String,
        age_secs: i64,
        timeout_secs: u64,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_key(kind: &'static str, key: &str) -> Self {
        StoreError::InvalidKey {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors from running a job's stage sequence.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Stage {stage} failed after {iterations} iteration(s)")]
    StageFailed { stage: String, iterations: u32 },

    #[error("Command `{command}` failed with exit code {}", describe_exit(.exit_code))]
    ExternalToolFailure {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("Quality gate failed: score {score} (threshold {threshold}), {failed_checks} validation check(s) failed")]
    GateFailure {
        score: u32,
        threshold: u32,
        failed_checks: usize,
    },

    #[error("Stage {stage} escalated: {reason}")]
    Escalated { stage: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Errors from the job scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Concurrency limit reached ({max} active pipelines)")]
    ConcurrencyLimit { max: usize },

    #[error("Failed to spawn job {job_id}: {source}")]
    SpawnFailed {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Admission paused after {failures} consecutive failures; run `convoy daemon resume`")]
    Paused { failures: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
