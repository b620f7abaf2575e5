//! Implementation of the `config` subcommand.

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use windowq_engine::Config;

use crate::commands::CommandResult;

/// Arguments to the `config` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The `config` subcommand to run.
    #[command(subcommand)]
    command: Option<ConfigSubcommand>,
}

/// Subcommands for the `config` command.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Displays a default configuration file.
    Init,

    /// Displays the effective configuration.
    Resolve,
}

/// The main function for the `config` subcommand.
pub fn config(args: Args, config: Config) -> CommandResult<()> {
    let config = match args.command {
        Some(ConfigSubcommand::Init) => Config::default(),
        Some(ConfigSubcommand::Resolve) | None => config,
    };

    println!(
        "{}",
        toml::to_string_pretty(&config).context("failed to serialize configuration")?
    );
    Ok(())
}
