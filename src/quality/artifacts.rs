//! Gathers the inputs the quality gate scores: test result, coverage, git state
//! and optional external audit findings.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tokio::process::Command;

use super::audit::Finding;
use crate::config::QualityConfig;
use crate::tracker::{AddedLine, GitTracker};

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap());

/// Everything the scorer looks at. Built by [`collect`] or directly in tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Artifacts {
    /// `None` when no test command is configured
    pub tests_passing: Option<bool>,
    /// `None` when no coverage report is available
    pub coverage_pct: Option<f64>,
    pub uncommitted_files: Vec<String>,
    pub added_lines: Vec<AddedLine>,
    pub external_findings: Vec<Finding>,
}

/// Collect artifacts for the workspace at `dir`.
pub async fn collect(dir: &Path, config: &QualityConfig) -> Result<Artifacts> {
    let tests_passing = match &config.test_command {
        Some(cmd) => Some(run_shell(dir, cmd).await?.0),
        None => None,
    };

    let coverage_pct = match &config.coverage_file {
        Some(file) => {
            let path = dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(content) => parse_coverage(&content),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "coverage file unreadable");
                    None
                }
            }
        }
        None => None,
    };

    let (uncommitted_files, added_lines) = if GitTracker::is_repo(dir) {
        let tracker = GitTracker::new(dir)?;
        (
            tracker.changed_files()?,
            tracker.added_lines(&config.base_ref)?,
        )
    } else {
        tracing::debug!(dir = %dir.display(), "not a git repository, skipping diff checks");
        (Vec::new(), Vec::new())
    };

    let external_findings = match &config.audit_command {
        Some(cmd) => {
            let (ok, stdout) = run_shell(dir, cmd).await?;
            if !ok {
                anyhow::bail!("Audit command `{}` failed", cmd);
            }
            parse_findings(&stdout)
                .with_context(|| format!("Audit command `{}` printed invalid findings", cmd))?
        }
        None => Vec::new(),
    };

    Ok(Artifacts {
        tests_passing,
        coverage_pct,
        uncommitted_files,
        added_lines,
        external_findings,
    })
}

async fn run_shell(dir: &Path, cmd: &str) -> Result<(bool, String)> {
    tracing::debug!(command = cmd, "running quality command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run `{}`", cmd))?;
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
    ))
}

/// Coverage percentage from a JSON summary (`total.lines.pct`) or the first `NN%` in text.
pub fn parse_coverage(content: &str) -> Option<f64> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(content)
        && let Some(pct) = value.pointer("/total/lines/pct").and_then(|v| v.as_f64())
    {
        return Some(pct.clamp(0.0, 100.0));
    }
    PERCENT
        .captures(content)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|pct| pct.clamp(0.0, 100.0))
}

pub fn parse_findings(stdout: &str) -> Result<Vec<Finding>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::audit::Category;
    use tempfile::tempdir;

    #[test]
    fn coverage_from_json_summary() {
        let json = r#"{"total":{"lines":{"total":200,"covered":170,"pct":85.0}}}"#;
        assert_eq!(parse_coverage(json), Some(85.0));
    }

    #[test]
    fn coverage_from_text() {
        assert_eq!(parse_coverage("TOTAL   1024   120   88.28%"), Some(88.28));
        assert_eq!(parse_coverage("no numbers here"), None);
    }

    #[test]
    fn findings_from_audit_output() {
        let out = r#"[{"category":"security","message":"sql built by concatenation","penalty":15}]"#;
        let findings = parse_findings(out).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, Category::Security);
        assert!(parse_findings("  \n").unwrap().is_empty());
        assert!(parse_findings("not json").is_err());
    }

    #[tokio::test]
    async fn collect_runs_test_command_and_reads_coverage() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cov.txt"), "lines: 91.5%").unwrap();
        let config = QualityConfig {
            test_command: Some("true".into()),
            coverage_file: Some("cov.txt".into()),
            ..Default::default()
        };
        let artifacts = collect(dir.path(), &config).await.unwrap();
        assert_eq!(artifacts.tests_passing, Some(true));
        assert_eq!(artifacts.coverage_pct, Some(91.5));
        assert!(artifacts.uncommitted_files.is_empty());
    }

    #[tokio::test]
    async fn collect_reports_failing_tests() {
        let dir = tempdir().unwrap();
        let config = QualityConfig {
            test_command: Some("exit 3".into()),
            ..Default::default()
        };
        let artifacts = collect(dir.path(), &config).await.unwrap();
        assert_eq!(artifacts.tests_passing, Some(false));
        assert_eq!(artifacts.coverage_pct, None);
    }
}
