//! `convoy status`: daemon state, worker liveness and this project's pipeline.

use anyhow::Result;
use console::style;
use serde::Serialize;

use convoy::errors::StoreError;
use convoy::heartbeat::{HeartbeatRecorder, HeartbeatStatus};
use convoy::pipeline::{PipelineState, StageStatus};
use convoy::scheduler::daemon::running_pid;
use convoy::scheduler::{DaemonState, JobResult};
use convoy::ui::icons::{CHECK, CROSS, SKIP, WAIT, WARN};

use super::{Context, print_json};

/// Completed jobs shown in the human view.
const RECENT_COMPLETIONS: usize = 5;

#[derive(Serialize)]
struct StatusReport {
    daemon_pid: Option<u32>,
    daemon: Option<DaemonState>,
    heartbeats: Vec<HeartbeatStatus>,
    pipeline: Option<PipelineState>,
}

fn optional<T>(result: Result<T, StoreError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn cmd_status(ctx: &Context, json: bool) -> Result<()> {
    let timeout = ctx.config.pipeline.heartbeat_timeout_secs;
    let report = StatusReport {
        daemon_pid: running_pid(ctx.paths()),
        daemon: optional(DaemonState::load(&ctx.env))?,
        heartbeats: HeartbeatRecorder::new(&ctx.env).list(timeout)?,
        pipeline: optional(PipelineState::load(&ctx.env))?,
    };

    if json {
        return print_json(&report);
    }

    println!();
    match report.daemon_pid {
        Some(pid) => println!("Daemon: {} (pid {})", style("running").green().bold(), pid),
        None => println!("Daemon: {}", style("not running").dim()),
    }

    if let Some(daemon) = &report.daemon {
        if daemon.paused {
            println!(
                "  {} Admission paused after {} consecutive failures (convoy daemon resume)",
                WARN,
                daemon.consecutive_failures
            );
        }
        if let Some(last) = daemon.last_poll {
            println!("  Last poll: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
        }

        println!();
        println!("Active ({}):", daemon.active_jobs.len());
        for job in &daemon.active_jobs {
            let hb = report.heartbeats.iter().find(|h| h.heartbeat.job_id == job.id);
            let detail = match hb {
                Some(h) if h.stale => style(format!(
                    "{} iter {} - stale {}s",
                    h.heartbeat.stage, h.heartbeat.iteration, h.age_secs
                ))
                .red()
                .to_string(),
                Some(h) => format!("{} iter {} ({}s ago)", h.heartbeat.stage, h.heartbeat.iteration, h.age_secs),
                None => style("no heartbeat").dim().to_string(),
            };
            println!("  {} {} {} [{}]", WAIT, style(&job.id).bold(), job.item.title, detail);
        }

        if !daemon.queued.is_empty() {
            println!();
            println!("Queued ({}):", daemon.queued.len());
            for item in &daemon.queued {
                println!("  {} {}", item.target, item.title);
            }
        }

        if !daemon.completed.is_empty() {
            println!();
            println!("Recent:");
            for job in daemon.completed.iter().rev().take(RECENT_COMPLETIONS) {
                let icon = if job.result == Some(JobResult::Success) { CHECK } else { CROSS };
                let duration = job
                    .duration_secs
                    .map(|s| format!(" in {}s", s))
                    .unwrap_or_default();
                println!("  {} {}{}", icon, job.id, duration);
            }
        }
    }

    let stale: Vec<&HeartbeatStatus> = report.heartbeats.iter().filter(|h| !h.alive).collect();
    if !stale.is_empty() {
        println!();
        for h in stale {
            println!(
                "{} {} is not alive (stage {}, last activity {}s ago)",
                WARN,
                style(&h.heartbeat.job_id).yellow().bold(),
                h.heartbeat.stage,
                h.age_secs
            );
        }
    }

    if let Some(state) = &report.pipeline {
        println!();
        println!(
            "Pipeline {} ({}): {}",
            style(&state.job_id).bold(),
            state.pipeline,
            state.status.as_str()
        );
        for (stage, status) in &state.stage_progress {
            let icon = match status {
                StageStatus::Complete => CHECK,
                StageStatus::Failed => CROSS,
                StageStatus::Skipped => SKIP,
                StageStatus::Running | StageStatus::Pending => WAIT,
            };
            println!("  {} {}: {}", icon, stage, status);
        }
    }
    println!();
    Ok(())
}
