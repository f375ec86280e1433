//! Quality reports written to `<workspace>/.convoy/quality/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

use super::GateResult;
use crate::env::Environment;
use crate::errors::StoreError;
use crate::util::{write_atomic, write_json_atomic};

pub const REPORT_JSON: &str = "report.json";
pub const REPORT_MD: &str = "report.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: GateResult,
}

impl QualityReport {
    pub fn new(result: GateResult, generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            result,
        }
    }

    pub fn to_markdown(&self) -> String {
        let r = &self.result;
        let mut md = String::new();
        let _ = writeln!(md, "# Quality Report\n");
        let _ = writeln!(md, "Generated: {}\n", self.generated_at.to_rfc3339());
        let _ = writeln!(
            md,
            "**Gate: {}** (score {} / threshold {}, validation {})\n",
            if r.passed { "PASS" } else { "FAIL" },
            r.score.overall_score,
            r.score.threshold,
            if r.validation.passed { "passed" } else { "failed" },
        );

        let _ = writeln!(md, "## Components\n");
        let _ = writeln!(md, "| Component | Score |");
        let _ = writeln!(md, "|---|---|");
        let c = &r.score.components;
        for (name, value) in [
            ("test_pass", c.test_pass),
            ("coverage", c.coverage),
            ("security", c.security),
            ("architecture", c.architecture),
            ("correctness", c.correctness),
        ] {
            let _ = writeln!(md, "| {} | {} |", name, value);
        }

        let _ = writeln!(md, "\n## Validation\n");
        for check in &r.validation.checks {
            let _ = writeln!(
                md,
                "- [{}] {}: {}",
                if check.passed { "x" } else { " " },
                check.check.name(),
                check.detail
            );
        }

        let _ = writeln!(md, "\n## Findings\n");
        if r.audit.findings.is_empty() {
            let _ = writeln!(md, "None.");
        }
        for f in &r.audit.findings {
            let location = f.file.as_deref().map(|p| format!(" ({})", p)).unwrap_or_default();
            let _ = writeln!(md, "- {} -{}: {}{}", f.category, f.penalty, f.message, location);
        }
        md
    }

    /// Write `report.json` and `report.md`; returns both paths.
    pub fn write(&self, env: &Environment) -> Result<(PathBuf, PathBuf), StoreError> {
        let dir = env.paths.quality_dir();
        let json_path = dir.join(REPORT_JSON);
        let md_path = dir.join(REPORT_MD);
        write_json_atomic(&json_path, self)?;
        write_atomic(&md_path, self.to_markdown().as_bytes())?;
        Ok((json_path, md_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;
    use crate::env::Paths;
    use crate::quality::{Artifacts, gate};
    use tempfile::tempdir;

    #[test]
    fn writes_json_and_markdown() {
        let dir = tempdir().unwrap();
        let env = Environment::new(Paths::new(dir.path(), dir.path()));
        let artifacts = Artifacts {
            tests_passing: Some(false),
            ..Default::default()
        };
        let report = QualityReport::new(gate(&artifacts, &QualityConfig::default()), env.now());
        let (json_path, md_path) = report.write(&env).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(value["passed"], false);
        assert!(value["score"]["overall_score"].is_u64());

        let md = std::fs::read_to_string(md_path).unwrap();
        assert!(md.contains("**Gate: FAIL**"));
        assert!(md.contains("- [ ] tests_passing: tests fail"));
    }
}
