//! Implementation of the `status` subcommand.

use anyhow::Context;
use clap::Parser;
use colored::Colorize as _;
use serde_json::Value;
use serde_json::json;
use windowq_engine::Config;
use windowq_engine::WindowDescriptor;
use windowq_engine::ledger::ActiveRecord;
use windowq_engine::ledger::Ledger;
use windowq_engine::ledger::TerminalRecord;

use crate::commands::CommandResult;
use crate::commands::read_ledger;

/// Arguments to the `status` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Prints the status as JSON.
    #[clap(long)]
    pub json: bool,

    /// Lists the failed windows.
    #[clap(long)]
    pub failed: bool,
}

/// The main function for the `status` subcommand.
pub fn status(args: Args, config: Config) -> CommandResult<()> {
    let ledger = read_ledger(&config)?;
    let paused = ledger.is_paused().context("failed to read the pause marker")?;

    if args.json {
        let status = to_json(&ledger, paused, args.failed);
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("failed to serialize status")?
        );
        return Ok(());
    }

    println!(
        "{state}: {queued} queued, {active} active, {completed} completed, {failed} failed",
        state = if paused {
            "paused".yellow().bold()
        } else {
            "running".green().bold()
        },
        queued = ledger.queued_count(),
        active = ledger.active_count(),
        completed = ledger.completed_count(),
        failed = ledger.failed_count()
    );

    for record in ledger.active() {
        println!(
            "  {window} on device {device} (pid {pid}, started {started})",
            window = record.window.to_string().bold(),
            device = record.device,
            pid = record.pid,
            started = record.started
        );
    }

    if args.failed {
        for record in ledger.failed() {
            println!(
                "  {window} {status} after {secs}s on device {device}",
                window = record.window.to_string().bold(),
                status = record.status.to_string().red(),
                secs = record.duration.as_secs(),
                device = record.device
            );
        }
    }

    Ok(())
}

/// Converts the ledger to a JSON value.
fn to_json(ledger: &Ledger, paused: bool, failed: bool) -> Value {
    let mut status = json!({
        "paused": paused,
        "queued": ledger.queued_count(),
        "active": ledger.active().iter().map(active_json).collect::<Vec<_>>(),
        "completed": ledger.completed_count(),
        "failed": ledger.failed_count(),
    });

    if failed {
        status["failed_windows"] = ledger.failed().iter().map(terminal_json).collect();
    }

    status
}

/// Converts a window to a JSON value.
fn window_json(window: &WindowDescriptor) -> Value {
    let id = window.id();
    json!({
        "group": id.group,
        "category": id.category,
        "subtype": id.subtype,
        "sequence": id.sequence,
        "location": window.location().display().to_string(),
    })
}

/// Converts an active record to a JSON value.
fn active_json(record: &ActiveRecord) -> Value {
    json!({
        "window": window_json(&record.window),
        "device": record.device,
        "pid": record.pid,
        "started": record.started.to_rfc3339(),
    })
}

/// Converts a terminal record to a JSON value.
fn terminal_json(record: &TerminalRecord) -> Value {
    json!({
        "window": window_json(&record.window),
        "device": record.device,
        "pid": record.pid,
        "started": record.started.to_rfc3339(),
        "duration_secs": record.duration.as_secs(),
        "status": record.status.as_str(),
    })
}
