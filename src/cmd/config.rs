//! `convoy config`: view, validate and initialize convoy.toml.

use anyhow::{Context as _, Result};

use convoy::config::{CONFIG_FILE, ConvoyToml};

use super::super::ConfigCommands;
use super::Context;

pub fn cmd_config(ctx: &Context, command: Option<ConfigCommands>) -> Result<()> {
    let source = ConvoyToml::locate(ctx.paths());

    match command {
        None | Some(ConfigCommands::Show) => {
            match &source {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No {} found, showing defaults", CONFIG_FILE),
            }
            println!("# Effective values include CONVOY_* environment overrides");
            println!();
            let rendered = toml::to_string_pretty(&ctx.config)
                .context("Failed to serialize effective configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if source.is_none() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let warnings = ctx.config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            let config_path = ctx.paths().workspace_dir().join(CONFIG_FILE);
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ConvoyToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [daemon] max_concurrent_pipelines, work_source_command, default_template");
            println!("  - [pipeline] branch_prefix, heartbeat_timeout_secs, iteration_timeout_secs");
            println!("  - [stages.<id>] command, test_command, max_iterations");
            println!("  - [quality] gate_threshold, coverage_threshold, weights");
        }
    }

    Ok(())
}
