//! Per-job pipeline state, persisted as Markdown with `key: value` lines so a
//! human can `cat` it and tooling can grep it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::env::Environment;
use crate::errors::StoreError;
use crate::template::PipelineTemplate;
use crate::util::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Complete => "complete",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => StageStatus::Pending,
            "running" => StageStatus::Running,
            "complete" => StageStatus::Complete,
            "failed" => StageStatus::Failed,
            "skipped" => StageStatus::Skipped,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Waiting,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => RunStatus::Running,
            "waiting" => RunStatus::Waiting,
            "complete" => RunStatus::Complete,
            "failed" => RunStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub job_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub goal: String,
    pub branch: String,
    pub current_stage: Option<String>,
    pub current_stage_description: String,
    /// Enabled stages of the template, in template order
    pub stage_progress: Vec<(String, StageStatus)>,
    pub completed_stages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state: every enabled stage pending.
    pub fn new(
        job_id: &str,
        template: &PipelineTemplate,
        goal: &str,
        branch: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            pipeline: template.name.clone(),
            status: RunStatus::Running,
            goal: one_line(goal),
            branch: branch.to_string(),
            current_stage: None,
            current_stage_description: String::new(),
            stage_progress: template
                .enabled_stage_ids()
                .into_iter()
                .map(|id| (id, StageStatus::Pending))
                .collect(),
            completed_stages: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: &str) -> Option<StageStatus> {
        self.stage_progress
            .iter()
            .find(|(id, _)| id == stage)
            .map(|(_, s)| *s)
    }

    /// Record a stage transition. Unknown stage ids are ignored so the key set never changes.
    pub fn set_stage(&mut self, stage: &str, status: StageStatus, now: DateTime<Utc>) {
        let Some(entry) = self.stage_progress.iter_mut().find(|(id, _)| id == stage) else {
            tracing::warn!(stage, "ignoring status for a stage outside the template");
            return;
        };
        entry.1 = status;
        if status == StageStatus::Complete && !self.completed_stages.iter().any(|s| s == stage) {
            self.completed_stages.push(stage.to_string());
        }
        self.updated_at = now;
    }

    pub fn enter_stage(&mut self, stage: &str, description: &str, now: DateTime<Utc>) {
        self.current_stage = Some(stage.to_string());
        self.current_stage_description = one_line(description);
        self.set_stage(stage, StageStatus::Running, now);
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Pipeline State\n\n");
        let mut kv = |k: &str, v: &str| {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        };
        kv("job_id", &self.job_id);
        kv("pipeline", &self.pipeline);
        kv("status", self.status.as_str());
        kv("goal", &self.goal);
        kv("branch", &self.branch);
        kv("current_stage", self.current_stage.as_deref().unwrap_or(""));
        kv("current_stage_description", &self.current_stage_description);
        kv("completed_stages", &self.completed_stages.join(","));
        kv("started_at", &self.started_at.to_rfc3339());
        kv("updated_at", &self.updated_at.to_rfc3339());
        out.push_str("\n## Stages\n\n");
        for (id, status) in &self.stage_progress {
            out.push_str(&format!("{}: {}\n", id, status));
        }
        out
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, StoreError> {
        let malformed = |reason: String| StoreError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let mut header: Vec<(&str, &str)> = Vec::new();
        let mut stages = Vec::new();
        let mut in_stages = false;
        for line in content.lines() {
            let line = line.trim_end();
            if line.starts_with("## ") {
                in_stages = line == "## Stages";
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if in_stages {
                let status = StageStatus::parse(value)
                    .ok_or_else(|| malformed(format!("unknown stage status '{}'", value)))?;
                stages.push((key.to_string(), status));
            } else {
                header.push((key, value));
            }
        }

        let get = |key: &str| header.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
        let require = |key: &str| get(key).ok_or_else(|| malformed(format!("missing '{}'", key)));
        let timestamp = |key: &str| -> Result<DateTime<Utc>, StoreError> {
            let raw = require(key)?;
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| malformed(format!("bad {} '{}': {}", key, raw, e)))
        };

        let status_raw = require("status")?;
        Ok(Self {
            job_id: require("job_id")?.to_string(),
            pipeline: require("pipeline")?.to_string(),
            status: RunStatus::parse(status_raw)
                .ok_or_else(|| malformed(format!("unknown status '{}'", status_raw)))?,
            goal: get("goal").unwrap_or_default().to_string(),
            branch: get("branch").unwrap_or_default().to_string(),
            current_stage: get("current_stage")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            current_stage_description: get("current_stage_description")
                .unwrap_or_default()
                .to_string(),
            stage_progress: stages,
            completed_stages: get("completed_stages")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            started_at: timestamp("started_at")?,
            updated_at: timestamp("updated_at")?,
        })
    }

    pub fn save(&self, env: &Environment) -> Result<(), StoreError> {
        write_atomic(&env.paths.pipeline_state_file(), self.render().as_bytes())
    }

    pub fn load(env: &Environment) -> Result<Self, StoreError> {
        let path = env.paths.pipeline_state_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    kind: "pipeline state",
                    key: path.display().to_string(),
                });
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        Self::parse(&content, &path)
    }
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
