//! Per-stage resumable snapshots.
//!
//! A checkpoint records how far a stage's retry loop got (iteration, whether
//! tests were passing, which files were touched, the commit it was at) so a
//! restarted run continues from there instead of redoing expensive iterations.
//! One JSON file per stage under `<workspace>/.convoy/checkpoints/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::env::{Clock, Environment};
use crate::errors::StoreError;
use crate::util::{is_safe_key, read_json, remove_if_exists, write_json_atomic};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub stage: String,
    pub iteration: u32,
    pub tests_passing: bool,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub git_sha: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    pub fn new(env: &Environment) -> Self {
        Self {
            dir: env.paths.checkpoint_dir(),
            clock: env.clock.clone(),
        }
    }

    fn path(&self, stage: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_key(stage) {
            return Err(StoreError::invalid_key("checkpoint", stage));
        }
        Ok(self.dir.join(format!("{}.json", stage)))
    }

    /// Overwrite the checkpoint for `stage`.
    pub fn save(
        &self,
        stage: &str,
        iteration: u32,
        tests_passing: bool,
        files_modified: Vec<String>,
        git_sha: &str,
    ) -> Result<Checkpoint, StoreError> {
        let checkpoint = Checkpoint {
            stage: stage.to_string(),
            iteration,
            tests_passing,
            files_modified,
            git_sha: git_sha.to_string(),
            saved_at: self.clock.now(),
        };
        write_json_atomic(&self.path(stage)?, &checkpoint)?;
        tracing::debug!(stage, iteration, tests_passing, "checkpoint saved");
        Ok(checkpoint)
    }

    /// The saved checkpoint for `stage`, or `NotFound`.
    pub fn restore(&self, stage: &str) -> Result<Checkpoint, StoreError> {
        read_json(&self.path(stage)?, "checkpoint", stage)
    }

    /// Like `restore`, but a missing checkpoint is `None`.
    pub fn find(&self, stage: &str) -> Result<Option<Checkpoint>, StoreError> {
        match self.restore(stage) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn clear(&self, stage: &str) -> Result<bool, StoreError> {
        remove_if_exists(&self.path(stage)?)
    }

    /// Remove every checkpoint file. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for stage in self.stages()? {
            if self.clear(&stage)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stages that currently have a checkpoint, sorted.
    pub fn stages(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };
        let mut stages: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .filter(|s| is_safe_key(s))
            .collect();
        stages.sort();
        Ok(stages)
    }
}
