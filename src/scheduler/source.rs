//! Where new work comes from.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

use super::state::{WorkItem, WorkTarget};

#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Every currently eligible item. The scheduler filters out known ones.
    async fn fetch(&self) -> Result<Vec<WorkItem>>;
}

/// Runs a shell command that prints a JSON array of issues
/// (`gh issue list --json number,title,body,labels` shape).
pub struct CommandWorkSource {
    command: String,
    workdir: PathBuf,
}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
}

/// `gh` emits label objects; hand-written sources may emit plain strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Name(String),
    Object { name: String },
}

impl RawLabel {
    fn into_name(self) -> String {
        match self {
            RawLabel::Name(name) | RawLabel::Object { name } => name,
        }
    }
}

impl CommandWorkSource {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

/// Parse the work source's JSON output.
pub fn parse_issues(stdout: &str) -> Result<Vec<WorkItem>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawIssue> =
        serde_json::from_str(stdout).context("Work source did not print a JSON array of issues")?;
    Ok(raw
        .into_iter()
        .map(|issue| WorkItem {
            target: WorkTarget::Issue(issue.number),
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(RawLabel::into_name).collect(),
            template: None,
        })
        .collect())
}

#[async_trait]
impl WorkSource for CommandWorkSource {
    async fn fetch(&self) -> Result<Vec<WorkItem>> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .output()
            .await
            .with_context(|| format!("Failed to run work source: {}", self.command))?;
        if !output.status.success() {
            bail!(
                "Work source `{}` exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_issues(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_gh_output() {
        let items = parse_issues(
            r#"[{"number":12,"title":"Bump serde","body":null,"labels":[{"name":"convoy","color":"fff"}]},
                {"number":13,"title":"Add cache","labels":["feature"]}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].target, WorkTarget::Issue(12));
        assert_eq!(items[0].labels, vec!["convoy"]);
        assert_eq!(items[1].labels, vec!["feature"]);
        assert!(items[1].body.is_empty());
    }

    #[test]
    fn empty_output_is_no_work() {
        assert!(parse_issues("  \n").unwrap().is_empty());
        assert!(parse_issues("not json").is_err());
    }

    #[tokio::test]
    async fn command_source_runs_in_workdir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("issues.json"), r#"[{"number":1,"title":"One"}]"#).unwrap();
        let source = CommandWorkSource::new("cat issues.json", dir.path());
        let items = source.fetch().await.unwrap();
        assert_eq!(items[0].title, "One");

        let failing = CommandWorkSource::new("echo nope >&2; exit 3", dir.path());
        let err = failing.fetch().await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
