//! Implementation of the `requeue` subcommand.

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use windowq_engine::Config;
use windowq_engine::ledger::TerminalStatus;

use crate::commands::CommandResult;
use crate::commands::open_ledger;

/// The failed status to re-queue.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailedStatus {
    /// Windows whose output lacked the success marker.
    Incomplete,
    /// Windows without output or that failed to launch.
    Failed,
}

impl From<FailedStatus> for TerminalStatus {
    fn from(status: FailedStatus) -> Self {
        match status {
            FailedStatus::Incomplete => Self::Incomplete,
            FailedStatus::Failed => Self::Failed,
        }
    }
}

/// Arguments to the `requeue` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Only re-queues windows that failed with this status.
    #[clap(long, value_name = "STATUS")]
    pub status: Option<FailedStatus>,
}

/// The main function for the `requeue` subcommand.
///
/// The failed records are kept, so a window that fails again gains a second
/// failed record.
pub fn requeue(args: Args, config: Config) -> CommandResult<()> {
    let mut ledger = open_ledger(&config)?;
    let count = ledger
        .requeue_failed(args.status.map(Into::into))
        .context("failed to re-queue windows")?;

    println!("re-queued {count} window(s)");
    Ok(())
}
