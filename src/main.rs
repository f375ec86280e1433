use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version, about = "Autonomous pipeline daemon - drive issues through gated delivery stages")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Shared state directory (defaults to $CONVOY_HOME, then ~/.convoy)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Project (or worktree) to operate on; defaults to the current directory
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Keep run state under .convoy/jobs/<JOB_ID> (for jobs sharing one checkout)
    #[arg(long, global = true, value_name = "JOB_ID")]
    pub job_scope: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one job's stages in the current project
    Start {
        /// Issue number the job works on
        #[arg(long)]
        issue: Option<u64>,

        /// Goal text (branch names derive from it)
        #[arg(long)]
        goal: Option<String>,

        /// Pipeline template name
        #[arg(long)]
        pipeline: Option<String>,

        /// Print the resolved plan without running anything
        #[arg(long)]
        dry_run: bool,

        /// Treat manual gates as auto and skip quality gates
        #[arg(long)]
        skip_gates: bool,

        /// Stages to treat as already complete (comma-separated)
        #[arg(long, value_delimiter = ',')]
        completed_stages: Vec<String>,

        /// Issue labels (comma-separated)
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,

        /// Explicit job id (defaults to pipeline-<issue> or goal-<slug>-<hash>)
        #[arg(long)]
        job_id: Option<String>,

        /// Remaining model budget in USD
        #[arg(long)]
        budget: Option<f64>,

        /// Print the dry-run plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show daemon, worker and pipeline status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run or control the scheduler daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Worker liveness records
    Heartbeat {
        #[command(subcommand)]
        command: HeartbeatCommands,
    },
    /// Per-stage resume points in this project
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Validate, audit and score the current changes
    Quality {
        #[command(subcommand)]
        command: QualityCommands,
    },
    /// List or show pipeline templates
    Templates {
        #[command(subcommand)]
        command: TemplatesCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Drop intervention markers for a running pipeline
    Intervene {
        #[command(subcommand)]
        command: InterveneCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum DaemonCommands {
    /// Run the poll/admit/reap loop in the foreground
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Lift the failure breaker
    Resume,
    /// Queue an issue or goal, re-admitting it if it already ran
    Enqueue {
        #[arg(long)]
        issue: Option<u64>,
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Send SIGTERM to the running daemon
    Stop,
}

#[derive(Subcommand, Clone)]
pub enum HeartbeatCommands {
    /// Record activity for a job
    Write {
        job_id: String,
        /// Worker pid (defaults to the calling process)
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        issue: Option<u64>,
        #[arg(long)]
        stage: String,
        #[arg(long, default_value = "0")]
        iteration: u32,
        #[arg(long, default_value = "")]
        activity: String,
    },
    /// Fail unless the job's heartbeat is fresh
    Check {
        job_id: String,
        /// Seconds after which a heartbeat is stale
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Every heartbeat with derived liveness
    List {
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Delete one job's heartbeat, or all of them
    Clear {
        job_id: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// Save a resume point for a stage
    Save {
        #[arg(long)]
        stage: String,
        #[arg(long)]
        iteration: u32,
        #[arg(long)]
        tests_passing: bool,
        /// Modified files (comma-separated); defaults to the git working tree changes
        #[arg(long, value_delimiter = ',')]
        files: Option<Vec<String>>,
        /// Defaults to HEAD
        #[arg(long)]
        git_sha: Option<String>,
    },
    /// Print a stage's checkpoint
    Restore { stage: String },
    /// Delete a stage's checkpoint, or all of them
    Clear {
        stage: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print every checkpoint
    List,
}

#[derive(Subcommand, Clone)]
pub enum QualityCommands {
    /// Run the validation checklist
    Validate,
    /// Run the diff audit
    Audit,
    /// Decide whether a stage should keep iterating
    Completion {
        #[arg(long, default_value = "build")]
        stage: String,
        #[arg(long, default_value = "10")]
        max_iterations: u32,
    },
    /// Compute the weighted quality score
    Score,
    /// Validate, audit and score; fail below threshold
    Gate,
    /// Write report.json and report.md
    Report,
}

#[derive(Subcommand, Clone)]
pub enum TemplatesCommands {
    List,
    Show { name: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default convoy.toml into the project
    Init,
}

#[derive(Subcommand, Clone)]
pub enum InterveneCommands {
    /// Force a stage to be skipped
    Skip { stage: String },
    /// Let a manual-gated stage proceed
    Approve { stage: String },
    /// Pause the pipeline before its next stage with a message
    Message { text: String },
    /// Remove the pause message
    Release,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let is_daemon = matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommands::Run { .. }
        }
    );
    if !is_daemon {
        convoy::logging::init(cli.verbose);
    }

    if let Err(e) = run(&cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let ctx = cmd::Context::new(cli, project_dir)?;

    match &cli.command {
        Commands::Start {
            issue,
            goal,
            pipeline,
            dry_run,
            skip_gates,
            completed_stages,
            labels,
            job_id,
            budget,
            json,
        } => {
            let args = cmd::StartArgs {
                issue: *issue,
                goal: goal.clone(),
                pipeline: pipeline.clone(),
                dry_run: *dry_run,
                skip_gates: *skip_gates,
                completed_stages: completed_stages.clone(),
                labels: labels.clone(),
                job_id: job_id.clone(),
                budget: *budget,
                json: *json,
            };
            cmd::cmd_start(&ctx, args).await?;
        }
        Commands::Status { json } => cmd::cmd_status(&ctx, *json)?,
        Commands::Daemon { command } => cmd::cmd_daemon(&ctx, command.clone()).await?,
        Commands::Heartbeat { command } => cmd::cmd_heartbeat(&ctx, command.clone())?,
        Commands::Checkpoint { command } => cmd::cmd_checkpoint(&ctx, command.clone())?,
        Commands::Quality { command } => cmd::cmd_quality(&ctx, command.clone()).await?,
        Commands::Templates { command } => cmd::cmd_templates(&ctx, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&ctx, command.clone())?,
        Commands::Intervene { command } => cmd::cmd_intervene(&ctx, command.clone())?,
    }

    Ok(())
}
