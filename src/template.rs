//! Pipeline templates: named, ordered stage lists.
//!
//! This module provides:
//! - `PipelineTemplate` / `StageDef` and their JSON format
//! - Built-in `fast`, `standard` and `full` templates
//! - Lookup of custom templates in the workspace and home template directories

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::StageCommandConfig;
use crate::env::Paths;
use crate::errors::PipelineError;

/// Every stage id a template may use, in canonical delivery order.
pub const KNOWN_STAGES: [&str; 10] = [
    "intake", "plan", "build", "test", "review", "pr", "merge", "deploy", "validate", "monitor",
];

pub fn is_known_stage(id: &str) -> bool {
    KNOWN_STAGES.contains(&id)
}

/// Default one-line description for a known stage.
pub fn stage_description(id: &str) -> &'static str {
    match id {
        "intake" => "Analyze the issue and gather context",
        "plan" => "Write an implementation plan",
        "build" => "Implement the change until tests pass",
        "test" => "Run the full test suite",
        "review" => "Review the diff for quality issues",
        "pr" => "Open a pull request",
        "merge" => "Merge the pull request",
        "deploy" => "Deploy the merged change",
        "validate" => "Validate the deployment",
        "monitor" => "Watch production health after release",
        _ => "Custom stage",
    }
}

/// Whether a stage advances on its own or waits for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePolicy {
    #[default]
    Auto,
    Manual,
}

impl std::fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatePolicy::Auto => write!(f, "auto"),
            GatePolicy::Manual => write!(f, "manual"),
        }
    }
}

/// Per-stage settings carried by a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// Run the quality gate before the stage may complete
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub quality_gate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One stage entry in a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDef {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub gate: GatePolicy,
    #[serde(default)]
    pub config: StageConfig,
}

fn default_enabled() -> bool {
    true
}

impl StageDef {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            enabled: true,
            gate: GatePolicy::Auto,
            config: StageConfig::default(),
        }
    }

    pub fn manual(mut self) -> Self {
        self.gate = GatePolicy::Manual;
        self
    }

    pub fn quality_gated(mut self) -> Self {
        self.config.quality_gate = true;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.config.max_iterations = Some(max);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A named, reusable stage configuration. Stage order is execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<StageDef>,
}

impl PipelineTemplate {
    /// Enabled stages in template order.
    pub fn enabled_stages(&self) -> impl Iterator<Item = &StageDef> {
        self.stages.iter().filter(|s| s.enabled)
    }

    pub fn enabled_stage_ids(&self) -> Vec<String> {
        self.enabled_stages().map(|s| s.id.clone()).collect()
    }

    pub fn stage(&self, id: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Reject unknown or duplicate stage ids and templates with nothing to run.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !is_known_stage(&stage.id) {
                return Err(PipelineError::Config(format!(
                    "Unknown stage id '{}' in template '{}'",
                    stage.id, self.name
                )));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "Duplicate stage id '{}' in template '{}'",
                    stage.id, self.name
                )));
            }
            if stage.config.max_iterations == Some(0) {
                return Err(PipelineError::Config(format!(
                    "Stage '{}' in template '{}' has max_iterations 0",
                    stage.id, self.name
                )));
            }
        }
        if self.enabled_stages().next().is_none() {
            return Err(PipelineError::Config(format!(
                "Template '{}' has no enabled stages",
                self.name
            )));
        }
        Ok(())
    }

    /// Parse a template from JSON and validate it.
    pub fn from_json(content: &str) -> Result<Self, PipelineError> {
        let template: PipelineTemplate = serde_json::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Invalid template JSON: {}", e)))?;
        template.validate()?;
        Ok(template)
    }

    /// Load a template by name: workspace templates, then home templates, then built-ins.
    pub fn load(name: &str, paths: &Paths) -> Result<Self, PipelineError> {
        if !crate::util::is_safe_key(name) {
            return Err(PipelineError::Config(format!(
                "Invalid template name '{}'",
                name
            )));
        }
        for dir in [paths.workspace_templates_dir(), paths.home_templates_dir()] {
            let path = dir.join(format!("{}.json", name));
            if path.exists() {
                return Self::load_file(&path);
            }
        }
        builtin(name).ok_or_else(|| {
            PipelineError::Config(format!(
                "Unknown pipeline template '{}' (built-ins: {})",
                name,
                BUILTIN_TEMPLATES.join(", ")
            ))
        })
    }

    pub fn load_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read template {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| PipelineError::Config(format!("{} ({})", e, path.display())))
    }
}

/// Settings for one stage after merging the template with `[stages.<id>]` config.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStage {
    pub id: String,
    pub gate: GatePolicy,
    pub quality_gate: bool,
    pub command: Option<String>,
    pub test_command: Option<String>,
    pub max_iterations: Option<u32>,
    pub description: String,
}

impl ResolvedStage {
    /// Template values win over config values.
    pub fn resolve(def: &StageDef, configured: &StageCommandConfig) -> Self {
        Self {
            id: def.id.clone(),
            gate: def.gate,
            quality_gate: def.config.quality_gate,
            command: def.config.command.clone().or_else(|| configured.command.clone()),
            test_command: def
                .config
                .test_command
                .clone()
                .or_else(|| configured.test_command.clone()),
            max_iterations: def.config.max_iterations.or(configured.max_iterations),
            description: def
                .config
                .description
                .clone()
                .or_else(|| configured.description.clone())
                .unwrap_or_else(|| stage_description(&def.id).to_string()),
        }
    }
}

pub const BUILTIN_TEMPLATES: [&str; 3] = ["fast", "standard", "full"];

/// Built-in templates.
pub fn builtin(name: &str) -> Option<PipelineTemplate> {
    let (description, stages) = match name {
        "fast" => (
            "Straight to a PR: no planning or review",
            vec![
                StageDef::new("intake"),
                StageDef::new("build").with_max_iterations(5),
                StageDef::new("test"),
                StageDef::new("pr"),
            ],
        ),
        "standard" => (
            "Plan, build, review and open a PR",
            vec![
                StageDef::new("intake"),
                StageDef::new("plan"),
                StageDef::new("build").with_max_iterations(10),
                StageDef::new("test"),
                StageDef::new("review").quality_gated(),
                StageDef::new("pr"),
            ],
        ),
        "full" => (
            "Full delivery through deploy and monitoring",
            vec![
                StageDef::new("intake"),
                StageDef::new("plan"),
                StageDef::new("build").with_max_iterations(15),
                StageDef::new("test"),
                StageDef::new("review").quality_gated(),
                StageDef::new("pr"),
                StageDef::new("merge").manual(),
                StageDef::new("deploy").manual(),
                StageDef::new("validate").quality_gated(),
                StageDef::new("monitor"),
            ],
        ),
        _ => return None,
    };
    Some(PipelineTemplate {
        name: name.to_string(),
        description: description.to_string(),
        stages,
    })
}

/// Every template name visible from `paths`, with where it comes from.
pub fn list_available(paths: &Paths) -> Vec<(String, String)> {
    let mut found: Vec<(String, String)> = Vec::new();
    for (dir, source) in [
        (paths.workspace_templates_dir(), "workspace"),
        (paths.home_templates_dir(), "home"),
    ] {
        for path in json_files(&dir) {
            if let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string())
                && !found.iter().any(|(n, _)| *n == stem)
            {
                found.push((stem, source.to_string()));
            }
        }
    }
    for name in BUILTIN_TEMPLATES {
        if !found.iter().any(|(n, _)| n == name) {
            found.push((name.to_string(), "built-in".to_string()));
        }
    }
    found
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*.json").to_string_lossy().to_string();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .map(|paths| paths.filter_map(|p| p.ok()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtins_are_valid() {
        for name in BUILTIN_TEMPLATES {
            let t = builtin(name).unwrap();
            t.validate().unwrap();
            assert_eq!(t.name, name);
        }
        assert!(builtin("nope").is_none());
    }

    #[test]
    fn full_template_covers_every_known_stage_in_order() {
        let full = builtin("full").unwrap();
        assert_eq!(full.enabled_stage_ids(), KNOWN_STAGES.map(String::from).to_vec());
        assert_eq!(full.stage("merge").unwrap().gate, GatePolicy::Manual);
    }

    #[test]
    fn enabled_stages_skip_disabled_and_keep_order() {
        let t = PipelineTemplate {
            name: "t".into(),
            description: String::new(),
            stages: vec![
                StageDef::new("intake"),
                StageDef::new("plan").disabled(),
                StageDef::new("build"),
            ],
        };
        assert_eq!(t.enabled_stage_ids(), vec!["intake", "build"]);
    }

    #[test]
    fn from_json_defaults_enabled_and_gate() {
        let t = PipelineTemplate::from_json(
            r#"{"name":"mini","stages":[
                {"id":"intake"},
                {"id":"plan","enabled":false},
                {"id":"build","gate":"manual","config":{"max_iterations":10}}
            ]}"#,
        )
        .unwrap();
        assert!(t.stages[0].enabled);
        assert_eq!(t.stages[0].gate, GatePolicy::Auto);
        assert!(!t.stages[1].enabled);
        assert_eq!(t.stages[2].gate, GatePolicy::Manual);
        assert_eq!(t.stages[2].config.max_iterations, Some(10));
    }

    #[test]
    fn unknown_stage_is_config_error() {
        let err = PipelineTemplate::from_json(r#"{"name":"x","stages":[{"id":"lint"}]}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("lint")));
    }

    #[test]
    fn duplicate_and_empty_templates_rejected() {
        assert!(
            PipelineTemplate::from_json(r#"{"name":"x","stages":[{"id":"build"},{"id":"build"}]}"#)
                .is_err()
        );
        assert!(
            PipelineTemplate::from_json(r#"{"name":"x","stages":[{"id":"build","enabled":false}]}"#)
                .is_err()
        );
    }

    #[test]
    fn load_prefers_workspace_over_builtin() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let paths = Paths::new(home.path(), ws.path());

        assert_eq!(PipelineTemplate::load("fast", &paths).unwrap().stages.len(), 4);

        std::fs::create_dir_all(paths.workspace_templates_dir()).unwrap();
        std::fs::write(
            paths.workspace_templates_dir().join("fast.json"),
            r#"{"name":"fast","stages":[{"id":"build"}]}"#,
        )
        .unwrap();
        assert_eq!(PipelineTemplate::load("fast", &paths).unwrap().stages.len(), 1);

        let listed = list_available(&paths);
        assert!(listed.contains(&("fast".to_string(), "workspace".to_string())));
        assert!(listed.contains(&("full".to_string(), "built-in".to_string())));
    }

    #[test]
    fn load_unknown_template_is_config_error() {
        let home = tempdir().unwrap();
        let paths = Paths::new(home.path(), home.path());
        let err = PipelineTemplate::load("turbo", &paths).unwrap_err();
        assert!(err.to_string().contains("Unknown pipeline template 'turbo'"));
        assert!(PipelineTemplate::load("../x", &paths).is_err());
    }

    #[test]
    fn resolve_prefers_template_over_config() {
        let def = StageDef::new("build").with_max_iterations(4);
        let configured = StageCommandConfig {
            command: Some("make".into()),
            test_command: Some("make test".into()),
            max_iterations: Some(9),
            description: None,
        };
        let resolved = ResolvedStage::resolve(&def, &configured);
        assert_eq!(resolved.max_iterations, Some(4));
        assert_eq!(resolved.command.as_deref(), Some("make"));
        assert_eq!(resolved.description, stage_description("build"));
    }
}
