//! `convoy templates`: list and show pipeline templates.

use anyhow::Result;
use console::style;

use convoy::template::{PipelineTemplate, list_available};

use super::super::TemplatesCommands;
use super::{Context, print_json};

pub fn cmd_templates(ctx: &Context, command: TemplatesCommands) -> Result<()> {
    match command {
        TemplatesCommands::List => {
            for (name, source) in list_available(ctx.paths()) {
                let description = PipelineTemplate::load(&name, ctx.paths())
                    .map(|t| t.description)
                    .unwrap_or_else(|e| style(format!("invalid: {}", e)).red().to_string());
                println!(
                    "{:<12} {:<10} {}",
                    style(&name).bold(),
                    style(source).dim(),
                    description
                );
            }
            Ok(())
        }
        TemplatesCommands::Show { name } => print_json(&PipelineTemplate::load(&name, ctx.paths())?),
    }
}
