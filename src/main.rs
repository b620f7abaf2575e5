//! The windowq command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use tracing_log::AsTrace;
use windowq::commands;
use windowq::commands::CommandResult;
use windowq::config::load_config;

#[derive(Subcommand)]
enum Commands {
    /// Discovers windows on storage and queues them for dispatch.
    Scan(commands::scan::Args),

    /// Scans for windows (unless `--dispatch-only`) and runs every queued
    /// window across the device pool.
    ///
    /// Press Ctrl-C to stop dispatching immediately; launched jobs keep
    /// running. A SIGTERM drains instead: no new windows are dispatched and
    /// the command exits once active jobs finish.
    Run(commands::run::Args),

    /// Displays the state of the ledger.
    Status(commands::status::Args),

    /// Pauses dispatch; active jobs are unaffected.
    Pause,

    /// Resumes dispatch.
    Resume,

    /// Queues failed windows again.
    Requeue(commands::requeue::Args),

    /// Clears every ledger collection.
    Clear(commands::clear::Args),

    /// Displays the effective configuration.
    Config(commands::config::Args),
}

#[derive(Parser)]
#[command(author, version, propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The path to the configuration file.
    ///
    /// Defaults to `windowq.toml` in the current directory, if present.
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity,
}

async fn inner() -> CommandResult<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init().map_err(anyhow::Error::from)?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(anyhow::Error::from)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan(args) => commands::scan::scan(args, config),
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::Status(args) => commands::status::status(args, config),
        Commands::Pause => commands::pause::pause(config),
        Commands::Resume => commands::pause::resume(config),
        Commands::Requeue(args) => commands::requeue::requeue(args, config),
        Commands::Clear(args) => commands::clear::clear(args, config),
        Commands::Config(args) => commands::config::config(args, config),
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(e.exit_code());
    }
}
