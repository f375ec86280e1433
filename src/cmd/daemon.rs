//! `convoy daemon`: the scheduler loop and its operator controls.

use anyhow::{Context as _, Result, bail};
use std::sync::Arc;
use std::time::Duration;

use convoy::scheduler::daemon::{self, DaemonLock};
use convoy::scheduler::{
    CommandWorkSource, EnqueueRequest, ProcessSpawner, Scheduler, WorkItem, WorkTarget,
    request_resume,
};

use super::super::DaemonCommands;
use super::Context;

pub async fn cmd_daemon(ctx: &Context, command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Run { once } => run(ctx, once).await,
        DaemonCommands::Resume => {
            request_resume(ctx.paths())?;
            println!("Resume requested; the daemon applies it on its next cycle.");
            Ok(())
        }
        DaemonCommands::Enqueue {
            issue,
            goal,
            title,
            labels,
            pipeline,
        } => {
            let target = match (issue, goal) {
                (Some(n), _) => WorkTarget::Issue(n),
                (None, Some(goal)) if !goal.trim().is_empty() => WorkTarget::Goal(goal),
                _ => bail!("Goal is required (pass --goal or --issue)"),
            };
            let title = title.unwrap_or_else(|| match &target {
                WorkTarget::Goal(goal) => goal.clone(),
                WorkTarget::Issue(_) => String::new(),
            });
            let mut item = WorkItem::new(target, title);
            item.labels = labels;
            item.template = pipeline;
            let job_id = item.target.job_id();
            let path = EnqueueRequest { item }.submit(ctx.paths())?;
            println!("Queued {} ({})", job_id, path.display());
            Ok(())
        }
        DaemonCommands::Stop => {
            let pid = daemon::stop(ctx.paths())?;
            println!("Sent SIGTERM to daemon (pid {})", pid);
            Ok(())
        }
    }
}

async fn run(ctx: &Context, once: bool) -> Result<()> {
    let paths = ctx.paths();
    let _guard = convoy::logging::init_with_file(ctx.verbose, &paths.logs_dir())
        .context("Failed to set up daemon logging")?;
    let _lock = DaemonLock::acquire(paths)?;

    for warning in ctx.config.validate() {
        tracing::warn!("{}", warning);
    }

    let exe = std::env::current_exe().context("Failed to locate the convoy binary")?;
    let spawner = ProcessSpawner::new(exe, &ctx.project_dir, paths.clone())
        .with_worktrees(ctx.config.daemon.use_worktrees);
    let source = CommandWorkSource::new(ctx.config.daemon.work_source_command(), &ctx.project_dir);
    let mut scheduler = Scheduler::new(
        ctx.env.clone(),
        ctx.config.clone(),
        Arc::new(source),
        Arc::new(spawner),
    )?;

    let interval = Duration::from_secs(ctx.config.daemon.poll_interval_secs.max(1));
    daemon::run(&mut scheduler, interval, once).await
}
