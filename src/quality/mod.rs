//! Quality gate: validation checks, weighted scoring and completion heuristics.
//!
//! Both `validate` and `score` are driven by declarative rule tables evaluated by
//! one generic loop each, so adding a check means adding a table row.

pub mod artifacts;
pub mod audit;
pub mod completion;
pub mod report;

pub use artifacts::{Artifacts, collect};
pub use audit::{AuditReport, Category, Finding, audit};
pub use completion::{Checklist, Completion, IterationHistory, IterationRecord, Verdict, completion};
pub use report::QualityReport;

use serde::{Deserialize, Serialize};

use crate::config::{QualityConfig, QualityWeights};

/// A validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    TestsPassing,
    Coverage,
    CleanTree,
    NoNewTodos,
    Secrets,
}

impl Check {
    pub fn name(&self) -> &'static str {
        match self {
            Check::TestsPassing => "tests_passing",
            Check::Coverage => "coverage",
            Check::CleanTree => "clean_tree",
            Check::NoNewTodos => "no_new_todos",
            Check::Secrets => "secrets",
        }
    }
}

/// `(check, penalty)` rows; penalties sum to 100.
pub const VALIDATION_RULES: [(Check, u32); 5] = [
    (Check::TestsPassing, 40),
    (Check::Coverage, 20),
    (Check::CleanTree, 10),
    (Check::NoNewTodos, 10),
    (Check::Secrets, 20),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub check: Check,
    pub passed: bool,
    pub penalty: u32,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Validation {
    pub checks: Vec<CheckResult>,
    pub score: u32,
    pub passed: bool,
}

fn evaluate(check: Check, artifacts: &Artifacts, config: &QualityConfig) -> (bool, String) {
    match check {
        Check::TestsPassing => match artifacts.tests_passing {
            Some(true) => (true, "tests pass".into()),
            Some(false) => (false, "tests fail".into()),
            None => (false, "no test command configured".into()),
        },
        Check::Coverage => match artifacts.coverage_pct {
            Some(pct) => (
                pct >= config.coverage_threshold,
                format!("{:.1}% (threshold {:.1}%)", pct, config.coverage_threshold),
            ),
            None => (false, "no coverage report".into()),
        },
        Check::CleanTree => {
            let n = artifacts.uncommitted_files.len();
            (n == 0, format!("{} uncommitted file(s)", n))
        }
        Check::NoNewTodos => {
            let n = audit::count_todo_markers(&artifacts.added_lines);
            (n == 0, format!("{} new TODO/FIXME marker(s)", n))
        }
        Check::Secrets => {
            let n = audit::count_secrets(&artifacts.added_lines);
            (
                n <= config.max_secret_findings,
                format!("{} secret-like line(s) (max {})", n, config.max_secret_findings),
            )
        }
    }
}

/// Run every validation rule. Fails overall if any single check fails.
pub fn validate(artifacts: &Artifacts, config: &QualityConfig) -> Validation {
    let checks: Vec<CheckResult> = VALIDATION_RULES
        .iter()
        .map(|&(check, penalty)| {
            let (passed, detail) = evaluate(check, artifacts, config);
            CheckResult {
                check,
                passed,
                penalty: if passed { 0 } else { penalty },
                detail,
            }
        })
        .collect();
    let lost: u32 = checks.iter().map(|c| c.penalty).sum();
    Validation {
        score: 100u32.saturating_sub(lost),
        passed: checks.iter().all(|c| c.passed),
        checks,
    }
}

/// Per-component scores, each 0-100.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Components {
    pub test_pass: u32,
    pub coverage: u32,
    pub security: u32,
    pub architecture: u32,
    pub correctness: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityScore {
    pub components: Components,
    pub overall_score: u32,
    pub threshold: u32,
    pub gate_pass: bool,
}

fn weighted_rows(c: &Components, w: &QualityWeights) -> [(u32, u32); 5] {
    [
        (w.test_pass, c.test_pass),
        (w.coverage, c.coverage),
        (w.security, c.security),
        (w.architecture, c.architecture),
        (w.correctness, c.correctness),
    ]
}

/// Weighted overall score compared against `gate_threshold`. Pure: same inputs, same score.
pub fn score(artifacts: &Artifacts, audit: &AuditReport, config: &QualityConfig) -> QualityScore {
    let components = Components {
        test_pass: if artifacts.tests_passing == Some(true) { 100 } else { 0 },
        coverage: artifacts
            .coverage_pct
            .map(|pct| pct.clamp(0.0, 100.0).round() as u32)
            .unwrap_or(0),
        security: audit.security,
        architecture: audit.architecture,
        correctness: audit.correctness,
    };

    let rows = weighted_rows(&components, &config.weights);
    // u64: a u32 weight times a 0-100 component cannot overflow
    let total_weight: u64 = rows.iter().map(|(w, _)| u64::from(*w)).sum();
    let overall_score = if total_weight == 0 {
        0
    } else {
        let weighted: u64 = rows.iter().map(|(w, v)| u64::from(*w) * u64::from(*v)).sum();
        ((weighted as f64) / (total_weight as f64)).round() as u32
    };

    QualityScore {
        components,
        overall_score,
        threshold: config.gate_threshold,
        gate_pass: overall_score >= config.gate_threshold,
    }
}

/// Outcome of `gate()`: validation and score together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateResult {
    pub validation: Validation,
    pub audit: AuditReport,
    pub score: QualityScore,
    pub passed: bool,
}

/// `validate() && score().gate_pass`.
pub fn gate(artifacts: &Artifacts, config: &QualityConfig) -> GateResult {
    let validation = validate(artifacts, config);
    let audit = audit(&artifacts.added_lines, &artifacts.external_findings);
    let score = score(artifacts, &audit, config);
    let passed = validation.passed && score.gate_pass;
    tracing::info!(
        overall = score.overall_score,
        threshold = score.threshold,
        validation = validation.passed,
        passed,
        "quality gate evaluated"
    );
    GateResult {
        validation,
        audit,
        score,
        passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AddedLine;

    fn good_artifacts() -> Artifacts {
        Artifacts {
            tests_passing: Some(true),
            coverage_pct: Some(92.0),
            uncommitted_files: vec![],
            added_lines: vec![AddedLine {
                file: "src/lib.rs".into(),
                content: "pub fn ok() {}".into(),
            }],
            external_findings: vec![],
        }
    }

    fn overall(artifacts: &Artifacts, config: &QualityConfig) -> u32 {
        let report = audit(&artifacts.added_lines, &artifacts.external_findings);
        score(artifacts, &report, config).overall_score
    }

    #[test]
    fn validation_penalties_sum_to_100() {
        let total: u32 = VALIDATION_RULES.iter().map(|(_, p)| p).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn good_artifacts_pass_validation_and_gate() {
        let config = QualityConfig::default();
        let result = gate(&good_artifacts(), &config);
        assert!(result.validation.passed);
        assert_eq!(result.validation.score, 100);
        assert!(result.score.gate_pass);
        assert!(result.passed);
    }

    #[test]
    fn failing_tests_fail_validation() {
        let mut a = good_artifacts();
        a.tests_passing = Some(false);
        let v = validate(&a, &QualityConfig::default());
        assert!(!v.passed);
        assert_eq!(v.score, 60);
        let failed: Vec<_> = v.checks.iter().filter(|c| !c.passed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].check, Check::TestsPassing);
    }

    #[test]
    fn secrets_above_threshold_fail() {
        let mut a = good_artifacts();
        a.added_lines.push(AddedLine {
            file: "cfg.rs".into(),
            content: r#"let token = "ghp_0123456789abcdef";"#.into(),
        });
        let mut config = QualityConfig::default();
        assert!(!validate(&a, &config).passed);
        config.max_secret_findings = 1;
        assert!(validate(&a, &config).passed);
    }

    #[test]
    fn score_is_deterministic() {
        let a = good_artifacts();
        let config = QualityConfig::default();
        let first = overall(&a, &config);
        for _ in 0..5 {
            assert_eq!(overall(&a, &config), first);
        }
        assert_eq!(first, 98);
    }

    #[test]
    fn degrading_any_check_never_raises_score() {
        let config = QualityConfig::default();
        let base = good_artifacts();
        let baseline = overall(&base, &config);

        let mut failing = base.clone();
        failing.tests_passing = Some(false);
        let mut low_cov = base.clone();
        low_cov.coverage_pct = Some(10.0);
        let mut dirty = base.clone();
        dirty.uncommitted_files.push("x.rs".into());
        let mut todo = base.clone();
        todo.added_lines.push(AddedLine {
            file: "a.rs".into(),
            content: "// TODO: finish".into(),
        });
        let mut unsafe_code = base.clone();
        unsafe_code.added_lines.push(AddedLine {
            file: "a.rs".into(),
            content: "let v = thing.unwrap();".into(),
        });

        for degraded in [failing, low_cov, dirty, todo, unsafe_code] {
            assert!(overall(&degraded, &config) <= baseline);
        }
    }

    #[test]
    fn below_threshold_fails_gate() {
        let mut a = good_artifacts();
        a.tests_passing = Some(false);
        a.coverage_pct = None;
        let result = gate(&a, &QualityConfig::default());
        assert_eq!(result.score.overall_score, 50);
        assert!(!result.score.gate_pass);
        assert!(!result.passed);
    }

    #[test]
    fn huge_weights_do_not_overflow() {
        let config = QualityConfig {
            weights: QualityWeights {
                test_pass: u32::MAX,
                coverage: u32::MAX,
                security: 0,
                architecture: 0,
                correctness: 0,
            },
            ..Default::default()
        };
        // (100 + 92) / 2 with equal weights
        assert_eq!(overall(&good_artifacts(), &config), 96);
    }

    #[test]
    fn zero_weights_score_zero() {
        let config = QualityConfig {
            weights: QualityWeights {
                test_pass: 0,
                coverage: 0,
                security: 0,
                architecture: 0,
                correctness: 0,
            },
            ..Default::default()
        };
        assert_eq!(overall(&good_artifacts(), &config), 0);
    }
}
