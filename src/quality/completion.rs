//! Completion heuristic over a stage's iteration history.
//!
//! After each iteration the state machine appends an [`IterationRecord`] to
//! `<workspace>/.convoy/history/<stage>.json`. [`completion`] reads that history
//! and decides whether another iteration is worth running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::env::Environment;
use crate::errors::StoreError;
use crate::util::{is_safe_key, read_json, remove_if_exists, write_json_atomic};

/// Iterations in the diminishing-returns window.
pub const STALL_WINDOW: usize = 3;
/// An iteration changing fewer lines than this counts as stalled.
pub const STALL_LINES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub tests_passing: bool,
    pub lines_changed: usize,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub finished_at: DateTime<Utc>,
}

/// All recorded iterations of one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterationHistory {
    pub stage: String,
    pub iterations: Vec<IterationRecord>,
}

impl IterationHistory {
    fn path(env: &Environment, stage: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_key(stage) {
            return Err(StoreError::invalid_key("iteration history", stage));
        }
        Ok(env.paths.history_dir().join(format!("{}.json", stage)))
    }

    /// History for `stage`; empty when none was recorded.
    pub fn load(env: &Environment, stage: &str) -> Result<Self, StoreError> {
        match read_json(&Self::path(env, stage)?, "iteration history", stage) {
            Ok(history) => Ok(history),
            Err(e) if e.is_not_found() => Ok(Self {
                stage: stage.to_string(),
                iterations: Vec::new(),
            }),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, env: &Environment) -> Result<(), StoreError> {
        write_json_atomic(&Self::path(env, &self.stage)?, self)
    }

    pub fn clear(env: &Environment, stage: &str) -> Result<bool, StoreError> {
        remove_if_exists(&Self::path(env, stage)?)
    }

    /// Replace any record for the same iteration, keeping order.
    pub fn record(&mut self, record: IterationRecord) {
        self.iterations.retain(|r| r.iteration != record.iteration);
        self.iterations.push(record);
        self.iterations.sort_by_key(|r| r.iteration);
    }
}

/// Goal subtasks parsed from a Markdown checklist (`- [ ]` / `- [x]`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub total: usize,
    pub checked: usize,
}

impl Checklist {
    pub fn parse(markdown: &str) -> Self {
        let mut list = Checklist::default();
        for line in markdown.lines() {
            let trimmed = line.trim_start();
            let rest = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "));
            let Some(rest) = rest else { continue };
            if rest.starts_with("[ ]") {
                list.total += 1;
            } else if rest.starts_with("[x]") || rest.starts_with("[X]") {
                list.total += 1;
                list.checked += 1;
            }
        }
        list
    }

    pub fn all_checked(&self) -> bool {
        self.total > 0 && self.checked == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Continue,
    Complete,
    Escalate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Continue => write!(f, "continue"),
            Verdict::Complete => write!(f, "complete"),
            Verdict::Escalate => write!(f, "escalate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub verdict: Verdict,
    pub reason: String,
}

impl Completion {
    fn new(verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            reason: reason.into(),
        }
    }
}

/// Decide whether a stage should keep iterating.
pub fn completion(
    history: &IterationHistory,
    checklist: Option<Checklist>,
    max_iterations: u32,
) -> Completion {
    let Some(last) = history.iterations.last() else {
        return Completion::new(Verdict::Continue, "no iterations recorded yet");
    };

    if let Some(list) = checklist
        && list.all_checked()
        && last.tests_passing
    {
        return Completion::new(
            Verdict::Complete,
            format!("all {} subtasks checked off and tests pass", list.total),
        );
    }

    let n = history.iterations.len();
    if n >= 2 && last.tests_passing && !history.iterations[n - 2].tests_passing {
        return Completion::new(Verdict::Complete, "tests went from failing to passing");
    }

    if n >= STALL_WINDOW {
        let window = &history.iterations[n - STALL_WINDOW..];
        if window.iter().all(|r| r.lines_changed < STALL_LINES) {
            return if last.tests_passing {
                Completion::new(
                    Verdict::Complete,
                    format!("last {} iterations changed little and tests pass", STALL_WINDOW),
                )
            } else {
                Completion::new(
                    Verdict::Escalate,
                    format!(
                        "diminishing returns: last {} iterations each changed fewer than {} lines",
                        STALL_WINDOW, STALL_LINES
                    ),
                )
            };
        }
    }

    if last.iteration >= max_iterations {
        return Completion::new(
            Verdict::Escalate,
            format!("reached max iterations ({})", max_iterations),
        );
    }

    Completion::new(Verdict::Continue, "still making progress")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Paths;
    use tempfile::tempdir;

    fn rec(iteration: u32, tests_passing: bool, lines_changed: usize) -> IterationRecord {
        IterationRecord {
            iteration,
            tests_passing,
            lines_changed,
            exit_code: Some(if tests_passing { 0 } else { 1 }),
            finished_at: Utc::now(),
        }
    }

    fn history(records: Vec<IterationRecord>) -> IterationHistory {
        IterationHistory {
            stage: "build".into(),
            iterations: records,
        }
    }

    #[test]
    fn empty_history_continues() {
        let c = completion(&history(vec![]), None, 10);
        assert_eq!(c.verdict, Verdict::Continue);
    }

    #[test]
    fn failing_to_passing_completes() {
        let h = history(vec![rec(1, false, 120), rec(2, true, 40)]);
        assert_eq!(completion(&h, None, 10).verdict, Verdict::Complete);
    }

    #[test]
    fn stalled_and_failing_escalates() {
        let h = history(vec![rec(1, false, 200), rec(2, false, 5), rec(3, false, 2), rec(4, false, 0)]);
        let c = completion(&h, None, 10);
        assert_eq!(c.verdict, Verdict::Escalate);
        assert!(c.reason.contains("diminishing returns"));
    }

    #[test]
    fn active_failing_continues() {
        let h = history(vec![rec(1, false, 200), rec(2, false, 80), rec(3, false, 45)]);
        assert_eq!(completion(&h, None, 10).verdict, Verdict::Continue);
    }

    #[test]
    fn max_iterations_escalates() {
        let h = history(vec![rec(1, false, 200), rec(2, false, 80)]);
        assert_eq!(completion(&h, None, 2).verdict, Verdict::Escalate);
    }

    #[test]
    fn checked_off_subtasks_complete() {
        let list = Checklist::parse("# Plan\n- [x] parse input\n- [X] write tests\n");
        assert!(list.all_checked());
        let h = history(vec![rec(1, true, 300)]);
        assert_eq!(completion(&h, Some(list), 10).verdict, Verdict::Complete);
    }

    #[test]
    fn checklist_counts_open_items() {
        let list = Checklist::parse("- [ ] one\n  * [x] two\n- plain bullet\n");
        assert_eq!(list, Checklist { total: 2, checked: 1 });
        assert!(!list.all_checked());
        assert!(!Checklist::default().all_checked());
    }

    #[test]
    fn history_persists_and_replaces_iterations() {
        let dir = tempdir().unwrap();
        let env = Environment::new(Paths::new(dir.path(), dir.path()));
        let mut h = IterationHistory::load(&env, "build").unwrap();
        assert!(h.iterations.is_empty());
        h.record(rec(1, false, 10));
        h.record(rec(2, false, 10));
        h.record(rec(1, true, 12));
        h.save(&env).unwrap();

        let loaded = IterationHistory::load(&env, "build").unwrap();
        assert_eq!(loaded.iterations.len(), 2);
        assert!(loaded.iterations[0].tests_passing);
        assert!(IterationHistory::clear(&env, "build").unwrap());
    }
}
