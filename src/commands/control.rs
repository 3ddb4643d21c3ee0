use std::path::Path;

use clap::Args;

use super::Workspace;
use crate::config::validate_cell_name;
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct DisableArgs {
    /// Why spawning is paused (shown by `colony status`)
    #[arg(long)]
    pub reason: Option<String>,
}

impl DisableArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        workspace.control().pause(self.reason.clone())?;
        println!("spawning disabled");
        Ok(())
    }
}

pub fn enable(config_path: Option<&Path>) -> anyhow::Result<()> {
    let workspace = Workspace::open(config_path)?;
    if workspace.control().resume()? {
        println!("spawning enabled");
    } else {
        println!("spawning was not disabled");
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct MuteArgs {
    /// Cell name
    pub cell: String,
}

impl MuteArgs {
    pub fn execute(&self, config_path: Option<&Path>, muted: bool) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        validate_cell_name(&self.cell)?;
        if !workspace.config.cells.contains_key(&self.cell) {
            return Err(ExitError::Other(format!("unknown cell: {}", self.cell)).into());
        }
        let changed = workspace.control().set_muted(&self.cell, muted)?;
        let verb = if muted { "muted" } else { "unmuted" };
        if changed {
            println!("{} {verb}", self.cell);
        } else {
            println!("{} already {verb}", self.cell);
        }
        Ok(())
    }
}
