//! Implementation of the `run` subcommand.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize as _;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use windowq_engine::Config;
use windowq_engine::DeviceAllocator;
use windowq_engine::scheduler::RunSummary;
use windowq_engine::scheduler::Scheduler;
use windowq_engine::supervisor::EnvironmentSnapshot;
use windowq_engine::supervisor::LocalSupervisor;

use crate::commands::CommandResult;
use crate::commands::open_ledger;
use crate::commands::scan::ScanOptions;

/// Arguments to the `run` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Dispatches the windows already queued without scanning first.
    #[clap(long)]
    pub dispatch_only: bool,

    /// The scan options; ignored with `--dispatch-only`.
    #[command(flatten)]
    pub scan: ScanOptions,

    /// The number of devices to schedule on, numbered from zero; overrides
    /// configuration and detection.
    #[clap(long, value_name = "N")]
    pub devices: Option<usize>,

    /// The interval between scheduling ticks, in milliseconds; overrides
    /// configuration.
    #[clap(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// The maximum time to wait for a free device, in seconds; overrides
    /// configuration.
    #[clap(long, value_name = "SECS")]
    pub device_wait_timeout_secs: Option<u64>,
}

impl Args {
    /// Applies the CLI arguments to the given configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(count) = self.devices {
            config.devices.count = Some(count);
            config.devices.ids = None;
        }

        if let Some(ms) = self.poll_interval_ms {
            config.scheduler.poll_interval_ms = ms;
        }

        if let Some(secs) = self.device_wait_timeout_secs {
            config.scheduler.device_wait_timeout_secs = secs;
        }
    }
}

/// The main function for the `run` subcommand.
pub async fn run(args: Args, mut config: Config) -> CommandResult<()> {
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let mut ledger = open_ledger(&config)?;
    if !args.dispatch_only {
        let count = args
            .scan
            .scanner(&config)?
            .scan_into_ledger(&mut ledger)
            .context(
                "failed to queue windows; use `--dispatch-only` to run the windows already queued",
            )?;
        info!("queued {count} window(s)");
    }

    let devices = config
        .devices
        .resolve()
        .context("failed to determine the devices to schedule on")?;
    let allocator = DeviceAllocator::new(devices).context("failed to create the device pool")?;
    let supervisor = LocalSupervisor::new(&config, EnvironmentSnapshot::capture())?;
    let mut scheduler = Scheduler::new(
        &config.scheduler,
        ledger,
        allocator,
        Arc::new(supervisor),
    )?;

    let signals = tokio::spawn(watch_signals(
        scheduler.cancellation_token(),
        scheduler.drain_token(),
    ));
    let result = scheduler.run().await;
    signals.abort();

    let summary = result?;
    print_summary(&summary, scheduler.ledger().queued_count());
    Ok(())
}

/// Maps operator signals onto the scheduler's tokens.
///
/// Ctrl-C interrupts the scheduler. SIGTERM drains it; a second SIGTERM
/// interrupts it.
async fn watch_signals(interrupt: CancellationToken, drain: CancellationToken) {
    #[cfg(unix)]
    let mut terminate = match tokio::signal::unix::signal(
        tokio::signal::unix::SignalKind::terminate(),
    ) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            None
        }
    };

    loop {
        #[cfg(unix)]
        let terminated = async {
            match &mut terminate {
                Some(signal) => signal.recv().await,
                None => std::future::pending().await,
            }
        };

        #[cfg(not(unix))]
        let terminated = std::future::pending::<Option<()>>();

        select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                error!("interrupted: launched jobs are left running");
                interrupt.cancel();
                return;
            }
            _ = terminated => {
                if drain.is_cancelled() {
                    error!("interrupted while draining: launched jobs are left running");
                    interrupt.cancel();
                    return;
                }

                warn!("draining: waiting for active jobs to finish");
                drain.cancel();
            }
        }
    }
}

/// Prints the summary of a run.
fn print_summary(summary: &RunSummary, queued: usize) {
    let failed = summary.failed + summary.launch_failures;
    println!(
        "dispatched {dispatched} window(s) in {ticks} tick(s) with at most {max} active",
        dispatched = summary.dispatched,
        ticks = summary.ticks,
        max = summary.max_active
    );
    println!(
        "{completed} completed, {failed} failed ({launch} failed to launch)",
        completed = summary.completed.to_string().green(),
        failed = if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        },
        launch = summary.launch_failures
    );

    if queued > 0 {
        println!("{queued} window(s) remain queued");
    }
}
