//! `convoy checkpoint`: per-stage resume points in the project.

use anyhow::{Result, bail};

use convoy::checkpoint::CheckpointStore;
use convoy::tracker::GitTracker;

use super::super::CheckpointCommands;
use super::{Context, print_json};

pub fn cmd_checkpoint(ctx: &Context, command: CheckpointCommands) -> Result<()> {
    let store = CheckpointStore::new(&ctx.env);

    match command {
        CheckpointCommands::Save {
            stage,
            iteration,
            tests_passing,
            files,
            git_sha,
        } => {
            let tracker = GitTracker::is_repo(&ctx.project_dir)
                .then(|| GitTracker::new(&ctx.project_dir).ok())
                .flatten();
            let files = match (files, &tracker) {
                (Some(files), _) => files,
                (None, Some(tracker)) => tracker.changed_files()?,
                (None, None) => Vec::new(),
            };
            let git_sha = git_sha
                .or_else(|| tracker.as_ref().and_then(|t| t.head_sha()))
                .unwrap_or_default();
            let checkpoint = store.save(&stage, iteration, tests_passing, files, &git_sha)?;
            print_json(&checkpoint)
        }
        CheckpointCommands::Restore { stage } => print_json(&store.restore(&stage)?),
        CheckpointCommands::Clear { stage, all } => {
            let cleared = match (stage, all) {
                (_, true) => store.clear_all()?,
                (Some(stage), false) => usize::from(store.clear(&stage)?),
                (None, false) => bail!("Pass a stage or --all"),
            };
            println!("Cleared {} checkpoint(s)", cleared);
            Ok(())
        }
        CheckpointCommands::List => {
            let checkpoints = store
                .stages()?
                .iter()
                .map(|stage| store.restore(stage))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&checkpoints)
        }
    }
}
