//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled            |
//! |--------------|-----------------------------|
//! | `start`      | `Start`                     |
//! | `status`     | `Status`                    |
//! | `daemon`     | `Daemon`                    |
//! | `heartbeat`  | `Heartbeat`                 |
//! | `checkpoint` | `Checkpoint`                |
//! | `quality`    | `Quality`                   |
//! | `templates`  | `Templates`                 |
//! | `config`     | `Config`                    |
//! | `intervene`  | `Intervene`                 |

pub mod checkpoint;
pub mod config;
pub mod daemon;
pub mod heartbeat;
pub mod intervene;
pub mod quality;
pub mod start;
pub mod status;
pub mod templates;

pub use checkpoint::cmd_checkpoint;
pub use config::cmd_config;
pub use daemon::cmd_daemon;
pub use heartbeat::cmd_heartbeat;
pub use intervene::cmd_intervene;
pub use quality::cmd_quality;
pub use start::{StartArgs, cmd_start};
pub use status::cmd_status;
pub use templates::cmd_templates;

use anyhow::Result;
use convoy::config::ConvoyToml;
use convoy::env::{Environment, Paths};
use serde::Serialize;
use std::path::PathBuf;

use super::Cli;

/// What every command needs: resolved paths, the environment and the layered config.
pub struct Context {
    pub env: Environment,
    pub config: ConvoyToml,
    pub project_dir: PathBuf,
    pub verbose: bool,
}

impl Context {
    pub fn new(cli: &Cli, project_dir: PathBuf) -> Result<Self> {
        let home = Paths::resolve_home(cli.home.as_deref());
        let mut paths = Paths::new(home, &project_dir);
        if let Some(scope) = &cli.job_scope {
            if !convoy::util::is_safe_key(scope) {
                anyhow::bail!("Invalid job scope '{}'", scope);
            }
            paths = paths.scoped(scope);
        }
        let config = ConvoyToml::load_layered(&paths)?;
        Ok(Self {
            env: Environment::new(paths),
            config,
            project_dir,
            verbose: cli.verbose,
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.env.paths
    }
}

/// Pretty JSON on stdout for machine-facing subcommands.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
