//! `convoy start`: run (or dry-run) one job's stages in the project.

use anyhow::{Result, bail};
use console::style;
use std::sync::Arc;
use std::time::Duration;

use convoy::pipeline::{RunOptions, RunPlan, ShellStageExecutor, StageMachine};
use convoy::scheduler::WorkTarget;
use convoy::template::PipelineTemplate;
use convoy::ui::PipelineUI;

use super::{Context, print_json};

pub struct StartArgs {
    pub issue: Option<u64>,
    pub goal: Option<String>,
    pub pipeline: Option<String>,
    pub dry_run: bool,
    pub skip_gates: bool,
    pub completed_stages: Vec<String>,
    pub labels: Vec<String>,
    pub job_id: Option<String>,
    pub budget: Option<f64>,
    pub json: bool,
}

impl StartArgs {
    fn target(&self) -> Result<WorkTarget> {
        match (self.issue, &self.goal) {
            (Some(n), _) => Ok(WorkTarget::Issue(n)),
            (None, Some(goal)) if !goal.trim().is_empty() => Ok(WorkTarget::Goal(goal.clone())),
            _ => bail!("Goal is required (pass --goal or --issue)"),
        }
    }

    fn goal(&self) -> String {
        match (&self.goal, self.issue) {
            (Some(goal), _) if !goal.trim().is_empty() => goal.clone(),
            (_, Some(n)) => format!("Issue {}", n),
            _ => String::new(),
        }
    }
}

pub async fn cmd_start(ctx: &Context, args: StartArgs) -> Result<()> {
    let target = args.target()?;
    let template_name = args
        .pipeline
        .clone()
        .unwrap_or_else(|| ctx.config.daemon.default_template.clone());
    let template = PipelineTemplate::load(&template_name, ctx.paths())?;

    let opts = RunOptions {
        job_id: args.job_id.clone().unwrap_or_else(|| target.job_id()),
        goal: args.goal(),
        issue: target.issue(),
        labels: args.labels.clone(),
        completed_stages: args.completed_stages.clone(),
        skip_gates: args.skip_gates,
        budget_usd: args.budget,
    };

    let timeout = Duration::from_secs(ctx.config.pipeline.iteration_timeout_secs);
    let executor = ShellStageExecutor::new(timeout).with_log_dir(ctx.paths().logs_dir());
    let mut machine = StageMachine::new(
        ctx.env.clone(),
        ctx.config.clone(),
        template,
        Arc::new(executor),
    );

    if args.dry_run {
        let plan = machine.plan(&opts)?;
        if args.json {
            print_json(&plan)?;
        } else {
            print_plan(&plan);
        }
        return Ok(());
    }

    let plan = machine.plan(&opts)?;
    if console::Term::stderr().is_term() {
        machine = machine.with_ui(Arc::new(PipelineUI::new(plan.stages.len() as u64, ctx.verbose)));
    }
    tracing::info!(job_id = %opts.job_id, template = %plan.template, branch = %plan.branch, "starting pipeline");

    let state = machine.run(&opts).await?;
    println!(
        "Pipeline {} complete: {} stage(s) done on {}",
        style(&state.job_id).bold(),
        state.completed_stages.len(),
        state.branch
    );
    Ok(())
}

fn print_plan(plan: &RunPlan) {
    println!("Pipeline: {}", plan.template);
    println!("Job:      {}", plan.job_id);
    println!("Branch:   {}", plan.branch);
    println!();
    println!("Stages:");
    for (i, stage) in plan.stages.iter().enumerate() {
        let mut notes = vec![stage.gate.to_string()];
        if stage.quality_gate {
            notes.push("quality gate".to_string());
        }
        if stage.max_iterations > 1 {
            notes.push(format!("max {} iterations", stage.max_iterations));
        }
        notes.push(format!("model {}", stage.model));
        let marker = if stage.already_complete {
            style(" (already complete)").dim().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}. {} [{}]{}",
            i + 1,
            style(&stage.id).bold(),
            notes.join(", "),
            marker
        );
    }
    println!();
    println!("{}", style("Dry run: nothing was executed.").dim());
}
