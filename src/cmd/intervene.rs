//! `convoy intervene`: marker files a running pipeline polls.

use anyhow::{Result, bail};

use convoy::pipeline::Markers;
use convoy::template::is_known_stage;

use super::super::InterveneCommands;
use super::Context;

fn known(stage: &str) -> Result<()> {
    if !is_known_stage(stage) {
        bail!("Unknown stage id '{}'", stage);
    }
    Ok(())
}

pub fn cmd_intervene(ctx: &Context, command: InterveneCommands) -> Result<()> {
    let markers = Markers::new(ctx.paths());
    match command {
        InterveneCommands::Skip { stage } => {
            known(&stage)?;
            markers.request_skip(&stage)?;
            println!("Stage {} will be skipped ({})", stage, markers.skip_path(&stage).display());
        }
        InterveneCommands::Approve { stage } => {
            known(&stage)?;
            markers.approve(&stage)?;
            println!("Stage {} approved", stage);
        }
        InterveneCommands::Message { text } => {
            markers.post_message(&text)?;
            println!(
                "Pipeline will pause before its next stage until released ({})",
                markers.human_message_path().display()
            );
        }
        InterveneCommands::Release => {
            if markers.clear_message()? {
                println!("Pause released");
            } else {
                println!("No pause message was set");
            }
        }
    }
    Ok(())
}
