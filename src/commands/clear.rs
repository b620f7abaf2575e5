//! Implementation of the `clear` subcommand.

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use windowq_engine::Config;

use crate::commands::CommandResult;
use crate::commands::open_ledger;

/// Arguments to the `clear` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Confirms clearing the ledger.
    #[clap(long)]
    pub yes: bool,
}

/// The main function for the `clear` subcommand.
///
/// Jobs recorded as active are forgotten but keep running.
pub fn clear(args: Args, config: Config) -> CommandResult<()> {
    let mut ledger = open_ledger(&config)?;
    if !args.yes {
        return Err(anyhow!(
            "refusing to clear a ledger with {queued} queued, {active} active, {completed} \
             completed and {failed} failed window(s) without `--yes`",
            queued = ledger.queued_count(),
            active = ledger.active_count(),
            completed = ledger.completed_count(),
            failed = ledger.failed_count()
        )
        .into());
    }

    ledger.clear().context("failed to clear the ledger")?;
    println!("cleared the ledger");
    Ok(())
}
