//! `convoy heartbeat`: write, check, list and clear liveness records.

use anyhow::{Result, bail};
use console::style;

use convoy::heartbeat::{HeartbeatRecorder, HeartbeatUpdate};
use convoy::ui::icons::WARN;

use super::super::HeartbeatCommands;
use super::{Context, print_json};

pub fn cmd_heartbeat(ctx: &Context, command: HeartbeatCommands) -> Result<()> {
    let recorder = HeartbeatRecorder::new(&ctx.env);
    let default_timeout = ctx.config.pipeline.heartbeat_timeout_secs;

    match command {
        HeartbeatCommands::Write {
            job_id,
            pid,
            issue,
            stage,
            iteration,
            activity,
        } => {
            let heartbeat = recorder.write(&HeartbeatUpdate {
                job_id: &job_id,
                // the CLI exits immediately, so the caller is the worker
                pid: pid.unwrap_or_else(std::os::unix::process::parent_id),
                issue,
                stage: &stage,
                iteration,
                activity: &activity,
            })?;
            print_json(&heartbeat)
        }
        HeartbeatCommands::Check { job_id, timeout } => {
            let heartbeat = recorder.check(&job_id, timeout.unwrap_or(default_timeout))?;
            print_json(&heartbeat)
        }
        HeartbeatCommands::List { timeout } => {
            let statuses = recorder.list(timeout.unwrap_or(default_timeout))?;
            for status in statuses.iter().filter(|s| !s.alive) {
                eprintln!(
                    "{} {} is not alive ({}s since last heartbeat)",
                    WARN,
                    style(&status.heartbeat.job_id).yellow().bold(),
                    status.age_secs
                );
            }
            print_json(&statuses)
        }
        HeartbeatCommands::Clear { job_id, all } => {
            let cleared = match (job_id, all) {
                (_, true) => recorder.clear_all()?,
                (Some(id), false) => usize::from(recorder.clear(&id)?),
                (None, false) => bail!("Pass a job id or --all"),
            };
            println!("Cleared {} heartbeat(s)", cleared);
            Ok(())
        }
    }
}
