//! Model and iteration-budget recommendations for stage execution.
//!
//! The state machine consults a [`ModelAdvisor`] when it resolves a stage's
//! execution parameters. [`HeuristicAdvisor`] is the built-in implementation:
//! it rates complexity from the goal text and labels and maps that onto a model
//! tier and an iteration budget.

use serde::{Deserialize, Serialize};

/// Complexity at or above which heavyweight stages get the largest model.
const HIGH_COMPLEXITY: u8 = 7;

/// Complexity at or below which cheap stages get the smallest model.
const LOW_COMPLEXITY: u8 = 3;

/// Remaining budget (USD) below which every stage drops to the smallest model.
const LOW_BUDGET_USD: f64 = 1.0;

const MIN_ITERATIONS: u32 = 3;
const MAX_ITERATIONS: u32 = 20;

/// Stages that are mostly bookkeeping and rarely benefit from a large model.
const CHEAP_STAGES: [&str; 5] = ["intake", "pr", "merge", "monitor", "deploy"];

/// Stages that reason about the whole change.
const DEEP_STAGES: [&str; 2] = ["plan", "review"];

const COMPLEX_KEYWORDS: [&str; 10] = [
    "refactor",
    "migrate",
    "architecture",
    "concurrency",
    "security",
    "performance",
    "database",
    "redesign",
    "distributed",
    "race",
];

const SIMPLE_KEYWORDS: [&str; 7] = ["typo", "bump", "update", "rename", "docs", "readme", "lint"];

/// What is known about a work item when sizing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueAnalysis {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub model: String,
    pub reason: String,
}

pub trait ModelAdvisor: Send + Sync {
    /// Complexity on a 1-10 scale.
    fn complexity(&self, issue: &IssueAnalysis) -> u8;

    fn recommend_model(
        &self,
        stage: &str,
        complexity: u8,
        budget_usd: Option<f64>,
    ) -> ModelRecommendation;

    fn estimate_iterations(&self, issue: &IssueAnalysis) -> u32;
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicAdvisor;

impl ModelAdvisor for HeuristicAdvisor {
    fn complexity(&self, issue: &IssueAnalysis) -> u8 {
        let text = format!("{} {}", issue.title, issue.body).to_lowercase();
        let mut score: i32 = 3;

        score += COMPLEX_KEYWORDS
            .iter()
            .filter(|k| text.contains(*k))
            .count() as i32
            * 2;
        score -= SIMPLE_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as i32;

        // Longer write-ups tend to describe larger changes
        let words = text.split_whitespace().count();
        score += match words {
            0..=30 => 0,
            31..=150 => 1,
            _ => 2,
        };

        for label in &issue.labels {
            match label.to_lowercase().as_str() {
                "epic" | "complex" | "breaking-change" => score += 3,
                "feature" | "enhancement" => score += 1,
                "good first issue" | "documentation" | "chore" => score -= 2,
                _ => {}
            }
        }

        score.clamp(1, 10) as u8
    }

    fn recommend_model(
        &self,
        stage: &str,
        complexity: u8,
        budget_usd: Option<f64>,
    ) -> ModelRecommendation {
        let pick = |model: &str, reason: String| ModelRecommendation {
            model: model.to_string(),
            reason,
        };

        if let Some(budget) = budget_usd
            && budget < LOW_BUDGET_USD
        {
            return pick("haiku", format!("remaining budget ${:.2} is low", budget));
        }
        if DEEP_STAGES.contains(&stage) {
            return pick("opus", format!("{} reasons about the whole change", stage));
        }
        if complexity >= HIGH_COMPLEXITY {
            return pick("opus", format!("complexity {} is high", complexity));
        }
        if CHEAP_STAGES.contains(&stage) && complexity <= LOW_COMPLEXITY {
            return pick("haiku", format!("{} is a lightweight stage", stage));
        }
        pick("sonnet", format!("default tier for complexity {}", complexity))
    }

    fn estimate_iterations(&self, issue: &IssueAnalysis) -> u32 {
        (2 + self.complexity(issue) as u32).clamp(MIN_ITERATIONS, MAX_ITERATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(title: &str, labels: &[&str]) -> IssueAnalysis {
        IssueAnalysis {
            title: title.to_string(),
            body: String::new(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn simple_issue_is_low_complexity() {
        let a = HeuristicAdvisor;
        assert!(a.complexity(&issue("Fix typo in README", &[])) <= 2);
    }

    #[test]
    fn complex_issue_is_high_complexity() {
        let a = HeuristicAdvisor;
        let c = a.complexity(&issue(
            "Refactor database layer to fix race in concurrency handling",
            &["epic"],
        ));
        assert_eq!(c, 10);
    }

    #[test]
    fn plan_and_review_get_opus() {
        let a = HeuristicAdvisor;
        assert_eq!(a.recommend_model("plan", 2, None).model, "opus");
        assert_eq!(a.recommend_model("review", 5, Some(50.0)).model, "opus");
    }

    #[test]
    fn low_budget_forces_haiku() {
        let a = HeuristicAdvisor;
        let rec = a.recommend_model("build", 9, Some(0.4));
        assert_eq!(rec.model, "haiku");
        assert!(rec.reason.contains("budget"));
    }

    #[test]
    fn build_tiers_by_complexity() {
        let a = HeuristicAdvisor;
        assert_eq!(a.recommend_model("build", 8, None).model, "opus");
        assert_eq!(a.recommend_model("build", 4, None).model, "sonnet");
        assert_eq!(a.recommend_model("intake", 2, None).model, "haiku");
    }

    #[test]
    fn iterations_are_clamped() {
        let a = HeuristicAdvisor;
        let trivial = issue("Fix typo in README docs", &["documentation"]);
        assert_eq!(a.complexity(&trivial), 1);
        assert_eq!(a.estimate_iterations(&trivial), MIN_ITERATIONS);
        let big = issue("Refactor and migrate the database architecture", &["epic"]);
        assert_eq!(a.estimate_iterations(&big), 12);
    }
}
