//! The per-job stage state machine.
//!
//! Walks the template's enabled stages in order. For each stage it honors
//! intervention markers, runs the stage's command in a bounded retry loop
//! (heartbeat per iteration, checkpoint after each finished iteration), then
//! applies the quality gate and manual gate before marking the stage complete.
//! The first stage failure is terminal for the job.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::branch::{branch_name, default_prefix};
use super::executor::{StageExecutor, StageRequest};
use super::markers::Markers;
use super::state::{PipelineState, RunStatus, StageStatus};
use crate::advisor::{HeuristicAdvisor, IssueAnalysis, ModelAdvisor};
use crate::checkpoint::CheckpointStore;
use crate::config::ConvoyToml;
use crate::env::Environment;
use crate::errors::PipelineError;
use crate::heartbeat::{HeartbeatPulse, HeartbeatRecorder};
use crate::quality::{self, Checklist, IterationHistory, IterationRecord, QualityReport, Verdict};
use crate::template::{GatePolicy, PipelineTemplate, ResolvedStage, is_known_stage};
use crate::tracker::GitTracker;
use crate::ui::PipelineUI;

/// What the caller knows about the job.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub job_id: String,
    pub goal: String,
    pub issue: Option<u64>,
    pub labels: Vec<String>,
    /// Stages to treat as already complete
    pub completed_stages: Vec<String>,
    /// Treat manual gates as auto and skip quality gates
    pub skip_gates: bool,
    pub budget_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub id: String,
    pub description: String,
    pub gate: GatePolicy,
    pub quality_gate: bool,
    pub max_iterations: u32,
    pub model: String,
    pub command: Option<String>,
    pub test_command: Option<String>,
    pub already_complete: bool,
}

/// The resolved run, as printed by `start --dry-run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub job_id: String,
    pub template: String,
    pub branch: String,
    pub stages: Vec<PlannedStage>,
}

impl RunPlan {
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }
}

pub struct StageMachine {
    env: Environment,
    config: ConvoyToml,
    template: PipelineTemplate,
    executor: Arc<dyn StageExecutor>,
    advisor: Arc<dyn ModelAdvisor>,
    heartbeats: HeartbeatRecorder,
    checkpoints: CheckpointStore,
    markers: Markers,
    ui: Option<Arc<PipelineUI>>,
    marker_poll: Duration,
}

impl StageMachine {
    pub fn new(
        env: Environment,
        config: ConvoyToml,
        template: PipelineTemplate,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        let marker_poll = Duration::from_secs(config.pipeline.marker_poll_secs.max(1));
        Self {
            heartbeats: HeartbeatRecorder::new(&env),
            checkpoints: CheckpointStore::new(&env),
            markers: Markers::new(&env.paths),
            env,
            config,
            template,
            executor,
            advisor: Arc::new(HeuristicAdvisor),
            ui: None,
            marker_poll,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn ModelAdvisor>) -> Self {
        self.advisor = advisor;
        self
    }

    pub fn with_ui(mut self, ui: Arc<PipelineUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn with_marker_poll(mut self, interval: Duration) -> Self {
        self.marker_poll = interval;
        self
    }

    pub fn with_heartbeats(mut self, recorder: HeartbeatRecorder) -> Self {
        self.heartbeats = recorder;
        self
    }

    fn issue_analysis(&self, opts: &RunOptions) -> IssueAnalysis {
        IssueAnalysis {
            title: opts.goal.clone(),
            body: String::new(),
            labels: opts.labels.clone(),
        }
    }

    /// Resolve template, stages and branch without touching disk.
    pub fn plan(&self, opts: &RunOptions) -> Result<RunPlan, PipelineError> {
        let unknown: Vec<&str> = opts
            .completed_stages
            .iter()
            .map(String::as_str)
            .filter(|s| !is_known_stage(s))
            .collect();
        if !unknown.is_empty() {
            return Err(PipelineError::Config(format!(
                "Unknown stage id(s) in completed stages: {}",
                unknown.join(", ")
            )));
        }

        let prefix = default_prefix(self.config.pipeline.branch_prefix.as_deref(), &opts.labels);
        let branch = branch_name(&prefix, &opts.goal, &opts.job_id);
        let issue = self.issue_analysis(opts);
        let complexity = self.advisor.complexity(&issue);

        let stages = self
            .template
            .enabled_stages()
            .map(|def| {
                let resolved = ResolvedStage::resolve(def, &self.config.stage(&def.id));
                let max_iterations = resolved.max_iterations.unwrap_or_else(|| {
                    if def.id == "build" {
                        self.advisor.estimate_iterations(&issue)
                    } else {
                        1
                    }
                });
                PlannedStage {
                    model: self
                        .advisor
                        .recommend_model(&def.id, complexity, opts.budget_usd)
                        .model,
                    already_complete: opts.completed_stages.contains(&def.id),
                    id: resolved.id,
                    description: resolved.description,
                    gate: resolved.gate,
                    quality_gate: resolved.quality_gate,
                    max_iterations,
                    command: resolved.command,
                    test_command: resolved.test_command,
                }
            })
            .collect();

        Ok(RunPlan {
            job_id: opts.job_id.clone(),
            template: self.template.name.clone(),
            branch,
            stages,
        })
    }

    /// Run every stage. Returns the final state; the state file reflects failures too.
    pub async fn run(&self, opts: &RunOptions) -> Result<PipelineState, PipelineError> {
        let plan = self.plan(opts)?;
        let mut state = self.initial_state(opts, &plan)?;
        state.save(&self.env)?;

        let result = match self.prepare_branch(&plan.branch) {
            Ok(()) => self.run_stages(&plan, opts, &mut state).await,
            Err(e) => Err(e),
        };

        let now = self.env.now();
        match &result {
            Ok(()) => {
                state.status = RunStatus::Complete;
                state.current_stage = None;
                state.current_stage_description.clear();
                tracing::info!(job_id = %opts.job_id, "pipeline complete");
            }
            Err(e) => {
                state.status = RunStatus::Failed;
                tracing::error!(job_id = %opts.job_id, error = %e, "pipeline failed");
            }
        }
        state.updated_at = now;
        state.save(&self.env)?;
        if let Err(e) = self.heartbeats.clear(&opts.job_id) {
            tracing::warn!(job_id = %opts.job_id, error = %e, "failed to clear heartbeat");
        }
        if let Some(ui) = &self.ui {
            ui.finish(result.is_ok(), &opts.job_id);
        }
        result.map(|_| state)
    }

    /// Fresh state, with completed stages carried over from a previous run of the same job.
    fn initial_state(&self, opts: &RunOptions, plan: &RunPlan) -> Result<PipelineState, PipelineError> {
        let now = self.env.now();
        let mut state = PipelineState::new(&opts.job_id, &self.template, &opts.goal, &plan.branch, now);
        let mut completed = opts.completed_stages.clone();

        match PipelineState::load(&self.env) {
            Ok(previous) if previous.job_id == opts.job_id => {
                tracing::info!(
                    job_id = %opts.job_id,
                    completed = %previous.completed_stages.join(","),
                    "resuming from previous pipeline state"
                );
                state.started_at = previous.started_at;
                completed.extend(previous.completed_stages);
            }
            Ok(previous) => {
                tracing::info!(job_id = %opts.job_id, previous = %previous.job_id, "replacing another job's pipeline state");
                for stage in &plan.stages {
                    self.reset_stage(&stage.id)?;
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable pipeline state"),
        }

        for stage in &completed {
            if state.stage_status(stage).is_some() {
                state.set_stage(stage, StageStatus::Complete, now);
            } else {
                tracing::warn!(stage = %stage, "completed stage is not in this template");
            }
        }
        Ok(state)
    }

    fn prepare_branch(&self, branch: &str) -> Result<(), PipelineError> {
        let workdir = &self.env.paths.workspace;
        if !GitTracker::is_repo(workdir) {
            return Ok(());
        }
        let tracker = GitTracker::new(workdir)?;
        if tracker.head_sha().is_none() {
            tracing::warn!(branch, "repository has no commits; staying on the current branch");
            return Ok(());
        }
        if tracker.current_branch().as_deref() != Some(branch) {
            tracker.checkout_new_branch(branch)?;
            tracing::info!(branch, "checked out job branch");
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        plan: &RunPlan,
        opts: &RunOptions,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        for planned in &plan.stages {
            let id = planned.id.as_str();

            if state.stage_status(id) == Some(StageStatus::Complete) {
                if let Some(ui) = &self.ui {
                    ui.stage_skipped(id, "already complete");
                }
                continue;
            }

            if self.markers.skip_requested(id) {
                tracing::info!(stage = id, "skip marker present");
                state.set_stage(id, StageStatus::Skipped, self.env.now());
                state.save(&self.env)?;
                if let Some(ui) = &self.ui {
                    ui.stage_skipped(id, "skip marker");
                }
                continue;
            }

            self.wait_for_human(opts, id, state).await?;

            state.enter_stage(id, &planned.description, self.env.now());
            state.save(&self.env)?;
            if let Some(ui) = &self.ui {
                ui.start_stage(id, &planned.description);
            }

            if let Err(e) = self.run_stage(planned, opts, &plan.branch, state).await {
                state.set_stage(id, StageStatus::Failed, self.env.now());
                state.save(&self.env)?;
                if let Some(ui) = &self.ui {
                    ui.stage_failed(id, &e.to_string());
                }
                return Err(e);
            }

            state.set_stage(id, StageStatus::Complete, self.env.now());
            state.save(&self.env)?;
            self.reset_stage(id)?;
            tracing::info!(stage = id, "stage complete");
            if let Some(ui) = &self.ui {
                ui.stage_complete(id);
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        planned: &PlannedStage,
        opts: &RunOptions,
        branch: &str,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        self.execute(planned, opts, branch).await?;
        if opts.skip_gates {
            return Ok(());
        }
        if planned.quality_gate {
            self.quality_gate(&planned.id).await?;
        }
        if planned.gate == GatePolicy::Manual {
            self.wait_for_approval(opts, &planned.id, state).await?;
        }
        Ok(())
    }

    /// Forget a stage's checkpoint and iteration history.
    fn reset_stage(&self, stage: &str) -> Result<(), PipelineError> {
        self.checkpoints.clear(stage)?;
        IterationHistory::clear(&self.env, stage)?;
        Ok(())
    }

    fn pulse(&self, opts: &RunOptions, stage: &str, iteration: u32) -> HeartbeatPulse {
        HeartbeatPulse::new(self.heartbeats.clone(), &opts.job_id, opts.issue, stage, iteration)
    }

    /// The bounded retry loop.
    async fn execute(
        &self,
        planned: &PlannedStage,
        opts: &RunOptions,
        branch: &str,
    ) -> Result<(), PipelineError> {
        let stage = planned.id.as_str();
        let Some(command) = planned.command.as_deref() else {
            self.pulse(opts, stage, 0).force("no command configured");
            tracing::debug!(stage, "stage has no command; completing immediately");
            return Ok(());
        };

        let max = planned.max_iterations;
        let mut start = 1;
        let mut history = IterationHistory::load(&self.env, stage)?;
        match self.checkpoints.find(stage)? {
            Some(cp) => {
                tracing::info!(stage, iteration = cp.iteration, tests_passing = cp.tests_passing, "resuming from checkpoint");
                let succeeded = cp.tests_passing
                    && history
                        .iterations
                        .last()
                        .is_some_and(|r| r.iteration == cp.iteration && r.exit_code == Some(0));
                if succeeded {
                    // only the gates were left when the previous run stopped
                    tracing::info!(stage, iteration = cp.iteration, "checkpointed iteration succeeded; continuing to gates");
                    return Ok(());
                }
                if cp.iteration >= max {
                    return Err(PipelineError::StageFailed {
                        stage: stage.to_string(),
                        iterations: cp.iteration,
                    });
                }
                start = cp.iteration + 1;
            }
            None => {
                // history without a checkpoint belongs to an earlier attempt
                if IterationHistory::clear(&self.env, stage)? {
                    tracing::debug!(stage, "discarded stale iteration history");
                }
                history.iterations.clear();
            }
        }

        let workdir = self.env.paths.workspace.clone();

        for iteration in start..=max {
            let pulse = self.pulse(opts, stage, iteration);
            pulse.force(&format!("iteration {}/{}", iteration, max));
            if let Some(ui) = &self.ui {
                ui.start_iteration(iteration, max, &planned.model);
            }

            let before = git_baseline(&workdir);
            let request = StageRequest {
                job_id: &opts.job_id,
                stage,
                iteration,
                goal: &opts.goal,
                model: &planned.model,
                branch,
                command,
                test_command: planned.test_command.as_deref(),
                workdir: &workdir,
            };
            let outcome = self.executor.run(&request, &pulse).await?;
            let (lines_changed, files_modified, head) = git_progress(&workdir, before.as_ref());

            history.record(IterationRecord {
                iteration,
                tests_passing: outcome.tests_passing,
                lines_changed,
                exit_code: outcome.exit_code,
                finished_at: self.env.now(),
            });
            history.save(&self.env)?;
            self.checkpoints
                .save(stage, iteration, outcome.tests_passing, files_modified, &head)?;

            if outcome.succeeded() {
                tracing::info!(stage, iteration, "stage succeeded");
                return Ok(());
            }

            let failure = PipelineError::ExternalToolFailure {
                command: if outcome.exit_code == Some(0) {
                    planned.test_command.clone().unwrap_or_else(|| command.to_string())
                } else {
                    command.to_string()
                },
                exit_code: outcome.exit_code,
            };
            tracing::warn!(stage, iteration, max, error = %failure, "iteration failed");
            if let Some(ui) = &self.ui {
                ui.iteration_failed(iteration, &failure.to_string());
            }

            if iteration < max && self.config.pipeline.completion_check {
                let checklist = std::fs::read_to_string(self.env.paths.plan_file())
                    .ok()
                    .map(|md| Checklist::parse(&md));
                let verdict = quality::completion(&history, checklist, max);
                tracing::debug!(stage, verdict = %verdict.verdict, reason = %verdict.reason, "completion check");
                if verdict.verdict == Verdict::Escalate {
                    return Err(PipelineError::Escalated {
                        stage: stage.to_string(),
                        reason: verdict.reason,
                    });
                }
            }
        }

        Err(PipelineError::StageFailed {
            stage: stage.to_string(),
            iterations: max,
        })
    }

    async fn quality_gate(&self, stage: &str) -> Result<(), PipelineError> {
        let artifacts = quality::collect(&self.env.paths.workspace, &self.config.quality).await?;
        let result = quality::gate(&artifacts, &self.config.quality);
        QualityReport::new(result.clone(), self.env.now()).write(&self.env)?;
        if let Some(ui) = &self.ui {
            ui.gate_result(result.passed, result.score.overall_score, result.score.threshold);
        }
        if result.passed {
            return Ok(());
        }
        tracing::warn!(stage, score = result.score.overall_score, "quality gate failed");
        Err(PipelineError::GateFailure {
            score: result.score.overall_score,
            threshold: result.score.threshold,
            failed_checks: result.validation.checks.iter().filter(|c| !c.passed).count(),
        })
    }

    /// Block while a human-message marker exists.
    async fn wait_for_human(
        &self,
        opts: &RunOptions,
        stage: &str,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        let mut paused = false;
        let pulse = self.pulse(opts, stage, 0);
        while let Some(message) = self.markers.human_message() {
            if !paused {
                tracing::warn!(stage, message = %message, "paused by human-message marker");
                if let Some(ui) = &self.ui {
                    ui.waiting(&format!(
                        "Paused before {}: {} (remove {} to continue)",
                        stage,
                        message,
                        self.markers.human_message_path().display()
                    ));
                }
                state.status = RunStatus::Waiting;
                state.save(&self.env)?;
                paused = true;
            }
            pulse.beat("waiting for operator");
            tokio::time::sleep(self.marker_poll).await;
        }
        if paused {
            state.status = RunStatus::Running;
            state.save(&self.env)?;
        }
        Ok(())
    }

    /// Block a manual-gated stage until its approval marker appears.
    async fn wait_for_approval(
        &self,
        opts: &RunOptions,
        stage: &str,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        let mut announced = false;
        let pulse = self.pulse(opts, stage, 0);
        while !self.markers.take_approval(stage)? {
            if !announced {
                tracing::info!(stage, "waiting for manual approval");
                if let Some(ui) = &self.ui {
                    ui.waiting(&format!(
                        "{} needs approval: convoy intervene approve {}",
                        stage, stage
                    ));
                }
                state.status = RunStatus::Waiting;
                state.save(&self.env)?;
                announced = true;
            }
            pulse.beat("waiting for approval");
            tokio::time::sleep(self.marker_poll).await;
        }
        if announced {
            state.status = RunStatus::Running;
            state.save(&self.env)?;
        }
        Ok(())
    }
}

struct Baseline {
    sha: String,
    lines: usize,
}

fn git_baseline(workdir: &std::path::Path) -> Option<Baseline> {
    if !GitTracker::is_repo(workdir) {
        return None;
    }
    let tracker = GitTracker::new(workdir).ok()?;
    let sha = tracker.head_sha()?;
    let lines = tracker.diff_size_since(&sha).ok()?.total();
    Some(Baseline { sha, lines })
}

/// Lines changed since `before`, files currently modified, and the HEAD sha.
fn git_progress(workdir: &std::path::Path, before: Option<&Baseline>) -> (usize, Vec<String>, String) {
    if !GitTracker::is_repo(workdir) {
        return (0, Vec::new(), String::new());
    }
    let Ok(tracker) = GitTracker::new(workdir) else {
        return (0, Vec::new(), String::new());
    };
    let lines = before
        .and_then(|b| {
            tracker
                .diff_size_since(&b.sha)
                .ok()
                .map(|now| now.total().abs_diff(b.lines))
        })
        .unwrap_or(0);
    let files = tracker.changed_files().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not list changed files");
        Vec::new()
    });
    (lines, files, tracker.head_sha().unwrap_or_default())
}
