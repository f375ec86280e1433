//! Per-job liveness and progress records.
//!
//! A running executor overwrites `<home>/heartbeats/<job_id>.json` every time it
//! makes progress. Observers (the daemon's reap step, `convoy status`) judge a
//! worker by how old that record is: a process can be alive yet hung inside a
//! blocking call, so PID liveness alone is not enough.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::env::{Clock, Environment};
use crate::errors::StoreError;
use crate::process::{ResourceSampler, pid_exists};
use crate::util::{is_safe_key, read_json, remove_if_exists, write_json_atomic};

/// Staleness threshold used when the caller doesn't give one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub job_id: String,
    pub pid: u32,
    #[serde(default)]
    pub issue: Option<u64>,
    pub stage: String,
    pub iteration: u32,
    #[serde(default)]
    pub last_activity: String,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub cpu_pct: f64,
    pub updated_at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout_secs: u64) -> bool {
        self.age_secs(now) > timeout_secs as i64
    }
}

/// A heartbeat annotated with derived liveness, as returned by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    #[serde(flatten)]
    pub heartbeat: Heartbeat,
    pub age_secs: i64,
    pub stale: bool,
    pub alive: bool,
}

/// Fields an executor supplies on each refresh.
#[derive(Debug, Clone)]
pub struct HeartbeatUpdate<'a> {
    pub job_id: &'a str,
    pub pid: u32,
    pub issue: Option<u64>,
    pub stage: &'a str,
    pub iteration: u32,
    pub activity: &'a str,
}

#[derive(Clone)]
pub struct HeartbeatRecorder {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    sampler: Option<Arc<ResourceSampler>>,
}

impl HeartbeatRecorder {
    pub fn new(env: &Environment) -> Self {
        Self {
            dir: env.paths.heartbeat_dir(),
            clock: env.clock.clone(),
            sampler: Some(Arc::new(ResourceSampler::new())),
        }
    }

    /// Skip resource sampling (memory and CPU stay zero).
    pub fn without_sampling(mut self) -> Self {
        self.sampler = None;
        self
    }

    fn path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_key(job_id) {
            return Err(StoreError::invalid_key("heartbeat", job_id));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    /// Upsert the record for `update.job_id` with a fresh `updated_at`.
    pub fn write(&self, update: &HeartbeatUpdate<'_>) -> Result<Heartbeat, StoreError> {
        let usage = self
            .sampler
            .as_ref()
            .map(|sampler| sampler.sample(update.pid))
            .unwrap_or_default();
        let heartbeat = Heartbeat {
            job_id: update.job_id.to_string(),
            pid: update.pid,
            issue: update.issue,
            stage: update.stage.to_string(),
            iteration: update.iteration,
            last_activity: update.activity.to_string(),
            memory_mb: usage.memory_mb,
            cpu_pct: usage.cpu_pct,
            updated_at: self.clock.now(),
        };
        write_json_atomic(&self.path(update.job_id)?, &heartbeat)?;
        tracing::trace!(job_id = update.job_id, stage = update.stage, iteration = update.iteration, "heartbeat");
        Ok(heartbeat)
    }

    pub fn read(&self, job_id: &str) -> Result<Heartbeat, StoreError> {
        read_json(&self.path(job_id)?, "heartbeat", job_id)
    }

    /// Fails if the record is missing or older than `timeout_secs`.
    pub fn check(&self, job_id: &str, timeout_secs: u64) -> Result<Heartbeat, StoreError> {
        let heartbeat = self.read(job_id)?;
        let now = self.clock.now();
        if heartbeat.is_stale(now, timeout_secs) {
            return Err(StoreError::StaleWorker {
                job_id: job_id.to_string(),
                age_secs: heartbeat.age_secs(now),
                timeout_secs,
            });
        }
        Ok(heartbeat)
    }

    /// Every record, annotated with `alive = pid_exists && !stale`. Unreadable files are skipped.
    pub fn list(&self, timeout_secs: u64) -> Result<Vec<HeartbeatStatus>, StoreError> {
        let now = self.clock.now();
        let mut statuses: Vec<HeartbeatStatus> = self
            .record_files()?
            .into_iter()
            .filter_map(|path| match read_json::<Heartbeat>(&path, "heartbeat", "") {
                Ok(hb) => Some(hb),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable heartbeat");
                    None
                }
            })
            .map(|heartbeat| {
                let stale = heartbeat.is_stale(now, timeout_secs);
                let alive = !stale && pid_exists(heartbeat.pid);
                HeartbeatStatus {
                    age_secs: heartbeat.age_secs(now),
                    stale,
                    alive,
                    heartbeat,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.heartbeat.job_id.cmp(&b.heartbeat.job_id));
        Ok(statuses)
    }

    /// Delete one record. Returns whether it existed.
    pub fn clear(&self, job_id: &str) -> Result<bool, StoreError> {
        remove_if_exists(&self.path(job_id)?)
    }

    /// Delete every record. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for path in self.record_files()? {
            if remove_if_exists(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn record_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && !p
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect())
    }
}

/// Throttled heartbeat refresher owned by one running stage.
///
/// Stage commands call [`HeartbeatPulse::beat`] whenever they make progress; at most
/// one write happens per `min_interval`. Write failures are logged, never fatal.
pub struct HeartbeatPulse {
    recorder: HeartbeatRecorder,
    job_id: String,
    pid: u32,
    issue: Option<u64>,
    stage: String,
    iteration: u32,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl HeartbeatPulse {
    pub fn new(
        recorder: HeartbeatRecorder,
        job_id: &str,
        issue: Option<u64>,
        stage: &str,
        iteration: u32,
    ) -> Self {
        Self {
            recorder,
            job_id: job_id.to_string(),
            pid: std::process::id(),
            issue,
            stage: stage.to_string(),
            iteration,
            min_interval: Duration::from_secs(10),
            last: Mutex::new(None),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Refresh unless the last write was less than `min_interval` ago.
    pub fn beat(&self, activity: &str) {
        let due = match self.last.lock() {
            Ok(mut last) => {
                let due = last.is_none_or(|t| t.elapsed() >= self.min_interval);
                if due {
                    *last = Some(Instant::now());
                }
                due
            }
            Err(_) => true,
        };
        if due {
            self.write(activity);
        }
    }

    /// Refresh unconditionally.
    pub fn force(&self, activity: &str) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(Instant::now());
        }
        self.write(activity);
    }

    fn write(&self, activity: &str) {
        let update = HeartbeatUpdate {
            job_id: &self.job_id,
            pid: self.pid,
            issue: self.issue,
            stage: &self.stage,
            iteration: self.iteration,
            activity,
        };
        if let Err(e) = self.recorder.write(&update) {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to write heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{ManualClock, Paths};
    use tempfile::{TempDir, tempdir};

    fn setup() -> (HeartbeatRecorder, Arc<ManualClock>, TempDir) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let env = Environment::with_clock(Paths::new(dir.path(), dir.path()), clock.clone());
        (HeartbeatRecorder::new(&env).without_sampling(), clock, dir)
    }

    fn update<'a>(job_id: &'a str, stage: &'a str, iteration: u32) -> HeartbeatUpdate<'a> {
        HeartbeatUpdate {
            job_id,
            pid: std::process::id(),
            issue: Some(123),
            stage,
            iteration,
            activity: "running",
        }
    }

    #[test]
    fn write_then_check_succeeds() {
        let (rec, _clock, _dir) = setup();
        rec.write(&update("pipeline-1", "build", 1)).unwrap();
        let hb = rec.check("pipeline-1", 1).unwrap();
        assert_eq!(hb.stage, "build");
    }

    #[test]
    fn check_missing_is_not_found() {
        let (rec, _clock, _dir) = setup();
        assert!(rec.check("ghost", 120).unwrap_err().is_not_found());
    }

    #[test]
    fn old_heartbeat_is_stale_even_with_live_pid() {
        let (rec, clock, _dir) = setup();
        rec.write(&update("pipeline-2", "test", 2)).unwrap();
        clock.advance(chrono::Duration::seconds(121));

        let err = rec.check("pipeline-2", 120).unwrap_err();
        assert!(matches!(err, StoreError::StaleWorker { age_secs: 121, .. }));

        let listed = rec.list(120).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].stale);
        assert!(!listed[0].alive);
    }

    #[test]
    fn heartbeat_at_exact_timeout_is_not_stale() {
        let (rec, clock, _dir) = setup();
        rec.write(&update("edge", "build", 1)).unwrap();
        clock.advance(chrono::Duration::seconds(120));
        assert!(rec.check("edge", 120).is_ok());
    }

    #[test]
    fn list_reports_live_worker() {
        let (rec, _clock, _dir) = setup();
        rec.write(&update("pipeline-123", "build", 3)).unwrap();
        let listed = rec.list(DEFAULT_TIMEOUT_SECS).unwrap();
        assert_eq!(listed.len(), 1);
        let entry = &listed[0];
        assert_eq!(entry.heartbeat.job_id, "pipeline-123");
        assert_eq!(entry.heartbeat.stage, "build");
        assert_eq!(entry.heartbeat.iteration, 3);
        assert!(entry.alive);
    }

    #[test]
    fn dead_pid_is_not_alive() {
        let (rec, _clock, _dir) = setup();
        let mut u = update("dead", "build", 1);
        u.pid = 0;
        rec.write(&u).unwrap();
        let listed = rec.list(DEFAULT_TIMEOUT_SECS).unwrap();
        assert!(!listed[0].stale);
        assert!(!listed[0].alive);
    }

    #[test]
    fn write_is_a_full_overwrite() {
        let (rec, clock, _dir) = setup();
        rec.write(&update("job", "plan", 1)).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        let second = rec.write(&update("job", "build", 4)).unwrap();
        let stored = rec.read("job").unwrap();
        assert_eq!(stored, second);
        assert_eq!(rec.list(120).unwrap().len(), 1);
    }

    #[test]
    fn clear_one_and_all() {
        let (rec, _clock, _dir) = setup();
        rec.write(&update("a", "build", 1)).unwrap();
        rec.write(&update("b", "build", 1)).unwrap();
        rec.write(&update("c", "build", 1)).unwrap();
        assert!(rec.clear("a").unwrap());
        assert!(!rec.clear("a").unwrap());
        assert_eq!(rec.clear_all().unwrap(), 2);
        assert!(rec.list(120).unwrap().is_empty());
    }

    #[test]
    fn list_on_missing_dir_is_empty() {
        let (rec, _clock, _dir) = setup();
        assert!(rec.list(120).unwrap().is_empty());
        assert_eq!(rec.clear_all().unwrap(), 0);
    }

    #[test]
    fn pulse_throttles_writes() {
        let (rec, clock, _dir) = setup();
        let pulse = HeartbeatPulse::new(rec.clone(), "pulse", None, "build", 2)
            .with_min_interval(Duration::from_secs(3600));
        pulse.beat("first");
        clock.advance(chrono::Duration::seconds(30));
        pulse.beat("second");
        assert_eq!(rec.read("pulse").unwrap().last_activity, "first");
        pulse.force("third");
        assert_eq!(rec.read("pulse").unwrap().last_activity, "third");
    }

    #[test]
    fn unsafe_job_id_is_an_invalid_key() {
        let (rec, _clock, _dir) = setup();
        let err = rec.write(&update("../x", "build", 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { kind: "heartbeat", .. }));
        assert!(!err.is_not_found());
    }
}
