//! Unified configuration for convoy, read from `convoy.toml`.
//!
//! Lookup order is `<project>/.convoy/convoy.toml`, then `<home>/convoy.toml`,
//! then built-in defaults. Environment variables and CLI flags are layered on top
//! by [`ConvoyToml::apply_env`] and the command handlers.
//!
//! # Configuration File Format
//!
//! ```toml
//! [daemon]
//! max_concurrent_pipelines = 2
//! poll_interval_secs = 60
//! max_consecutive_failures = 3
//! watch_label = "convoy"
//! default_template = "standard"
//!
//! [pipeline]
//! heartbeat_timeout_secs = 120
//! marker_poll_secs = 5
//!
//! [stages.build]
//! command = "./scripts/agent.sh \"$CONVOY_GOAL\""
//! test_command = "cargo test"
//! max_iterations = 10
//!
//! [quality]
//! gate_threshold = 70
//! coverage_threshold = 80
//!
//! [quality.weights]
//! test_pass = 30
//! coverage = 20
//! security = 20
//! architecture = 15
//! correctness = 15
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::env::Paths;

pub const CONFIG_FILE: &str = "convoy.toml";

/// Scheduler (daemon) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Concurrency cap on active pipelines
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_pipelines: usize,
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Consecutive failed jobs before admission stops
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Completed jobs kept in daemon state
    #[serde(default = "default_completed_history")]
    pub completed_history: usize,
    /// Issue label the work source watches
    #[serde(default = "default_watch_label")]
    pub watch_label: String,
    /// Shell command printing a JSON array of work items (defaults to `gh issue list`)
    #[serde(default)]
    pub work_source_command: Option<String>,
    /// Give every job its own git worktree
    #[serde(default = "default_true")]
    pub use_worktrees: bool,
    /// Template used when the operator doesn't pick one
    #[serde(default = "default_template")]
    pub default_template: String,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_failures() -> u32 {
    3
}

fn default_completed_history() -> usize {
    50
}

fn default_watch_label() -> String {
    "convoy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    "standard".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: default_max_concurrent(),
            poll_interval_secs: default_poll_interval(),
            max_consecutive_failures: default_max_failures(),
            completed_history: default_completed_history(),
            watch_label: default_watch_label(),
            work_source_command: None,
            use_worktrees: default_true(),
            default_template: default_template(),
        }
    }
}

impl DaemonConfig {
    pub fn work_source_command(&self) -> String {
        self.work_source_command.clone().unwrap_or_else(|| {
            format!(
                "gh issue list --label {} --state open --json number,title,body,labels",
                self.watch_label
            )
        })
    }
}

/// Stage state machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Branch prefix; unset means `fix/`, or `feat/` for feature-labelled work
    #[serde(default)]
    pub branch_prefix: Option<String>,
    /// Heartbeat age after which a worker counts as stale
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// How often blocked gates re-check their marker files
    #[serde(default = "default_marker_poll")]
    pub marker_poll_secs: u64,
    /// Upper bound on one run of a stage command
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,
    /// Stop retrying a stage early when the completion heuristic escalates
    #[serde(default = "default_true")]
    pub completion_check: bool,
}

fn default_heartbeat_timeout() -> u64 {
    120
}

fn default_marker_poll() -> u64 {
    5
}

fn default_iteration_timeout() -> u64 {
    1800
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            branch_prefix: None,
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            marker_poll_secs: default_marker_poll(),
            iteration_timeout_secs: default_iteration_timeout(),
            completion_check: default_true(),
        }
    }
}

/// How a stage's unit of work is carried out.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageCommandConfig {
    /// Shell command doing the stage's work
    #[serde(default)]
    pub command: Option<String>,
    /// Command whose exit status decides whether tests pass
    #[serde(default)]
    pub test_command: Option<String>,
    /// Retry bound for the stage
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Human-readable description shown in pipeline state
    #[serde(default)]
    pub description: Option<String>,
}

/// Weights for the overall quality score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityWeights {
    #[serde(default = "default_weight_test_pass")]
    pub test_pass: u32,
    #[serde(default = "default_weight_coverage")]
    pub coverage: u32,
    #[serde(default = "default_weight_security")]
    pub security: u32,
    #[serde(default = "default_weight_architecture")]
    pub architecture: u32,
    #[serde(default = "default_weight_correctness")]
    pub correctness: u32,
}

fn default_weight_test_pass() -> u32 {
    30
}

fn default_weight_coverage() -> u32 {
    20
}

fn default_weight_security() -> u32 {
    20
}

fn default_weight_architecture() -> u32 {
    15
}

fn default_weight_correctness() -> u32 {
    15
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            test_pass: default_weight_test_pass(),
            coverage: default_weight_coverage(),
            security: default_weight_security(),
            architecture: default_weight_architecture(),
            correctness: default_weight_correctness(),
        }
    }
}

/// Largest weight `validate` accepts without a warning.
pub const MAX_WEIGHT: u32 = 100;

impl QualityWeights {
    pub fn named(&self) -> [(&'static str, u32); 5] {
        [
            ("test_pass", self.test_pass),
            ("coverage", self.coverage),
            ("security", self.security),
            ("architecture", self.architecture),
            ("correctness", self.correctness),
        ]
    }

    pub fn total(&self) -> u64 {
        self.named().iter().map(|(_, w)| u64::from(*w)).sum()
    }
}

/// Quality gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_gate_threshold")]
    pub gate_threshold: u32,
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    /// Secret-like findings tolerated before validation fails
    #[serde(default)]
    pub max_secret_findings: usize,
    #[serde(default)]
    pub test_command: Option<String>,
    /// Coverage summary file, relative to the workspace
    #[serde(default)]
    pub coverage_file: Option<PathBuf>,
    /// External semantic pass printing JSON findings
    #[serde(default)]
    pub audit_command: Option<String>,
    /// Git ref the diff heuristics compare against
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    #[serde(default)]
    pub weights: QualityWeights,
}

fn default_gate_threshold() -> u32 {
    70
}

fn default_coverage_threshold() -> f64 {
    80.0
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            gate_threshold: default_gate_threshold(),
            coverage_threshold: default_coverage_threshold(),
            max_secret_findings: 0,
            test_command: None,
            coverage_file: None,
            audit_command: None,
            base_ref: default_base_ref(),
            weights: QualityWeights::default(),
        }
    }
}

/// The complete convoy.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConvoyToml {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Per-stage command settings keyed by stage id
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommandConfig>,
    #[serde(default)]
    pub quality: QualityConfig,
}

impl ConvoyToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse convoy.toml")
    }

    /// Workspace config, then home config, then defaults. Environment overrides apply last.
    pub fn load_layered(paths: &Paths) -> Result<Self> {
        let mut config = match Self::locate(paths) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Path of the config file that `load_layered` would read, if any.
    pub fn locate(paths: &Paths) -> Option<PathBuf> {
        [
            paths.workspace_dir().join(CONFIG_FILE),
            paths.home.join(CONFIG_FILE),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    /// Apply `CONVOY_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(max) = std::env::var("CONVOY_MAX_PIPELINES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.daemon.max_concurrent_pipelines = max;
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize convoy.toml")?;
        crate::util::write_atomic(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Command settings for a stage; empty when none are configured.
    pub fn stage(&self, stage_id: &str) -> StageCommandConfig {
        self.stages.get(stage_id).cloned().unwrap_or_default()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.daemon.max_concurrent_pipelines == 0 {
            warnings.push("daemon.max_concurrent_pipelines is 0: no job will ever be admitted".into());
        }
        if self.daemon.poll_interval_secs == 0 {
            warnings.push("daemon.poll_interval_secs is 0: the daemon will busy-poll".into());
        }
        if self.daemon.max_consecutive_failures == 0 {
            warnings.push(
                "daemon.max_consecutive_failures is 0: admission pauses after the first failure"
                    .into(),
            );
        }
        if self.quality.gate_threshold > 100 {
            warnings.push(format!(
                "quality.gate_threshold {} exceeds 100: the gate can never pass",
                self.quality.gate_threshold
            ));
        }
        if !(0.0..=100.0).contains(&self.quality.coverage_threshold) {
            warnings.push(format!(
                "quality.coverage_threshold {} is outside 0-100",
                self.quality.coverage_threshold
            ));
        }
        if self.quality.weights.total() == 0 {
            warnings.push("quality.weights sum to 0: every score will be 0".into());
        }
        for (name, weight) in self.quality.weights.named() {
            if weight > MAX_WEIGHT {
                warnings.push(format!(
                    "quality.weights.{} is {}: weights are relative and should stay within 0-{}",
                    name, weight, MAX_WEIGHT
                ));
            }
        }
        for (stage, cfg) in &self.stages {
            if !crate::template::is_known_stage(stage) {
                warnings.push(format!("[stages.{}] does not name a known stage", stage));
            }
            if cfg.max_iterations == Some(0) {
                warnings.push(format!("stages.{}.max_iterations is 0", stage));
            }
        }

        warnings
    }
}
