//! Implementation of the `pause` and `resume` subcommands.

use anyhow::Context;
use windowq_engine::Config;

use crate::commands::CommandResult;
use crate::commands::open_ledger;

/// The main function for the `pause` subcommand.
///
/// A running scheduler observes the pause at its next tick.
pub fn pause(config: Config) -> CommandResult<()> {
    set_paused(&config, true)?;
    println!("dispatch paused");
    Ok(())
}

/// The main function for the `resume` subcommand.
pub fn resume(config: Config) -> CommandResult<()> {
    set_paused(&config, false)?;
    println!("dispatch resumed");
    Ok(())
}

/// Sets the ledger's pause flag.
fn set_paused(config: &Config, paused: bool) -> anyhow::Result<()> {
    open_ledger(config)?
        .set_paused(paused)
        .context("failed to update the pause marker")
}
