//! Implementation of the `scan` subcommand.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use windowq_engine::Config;
use windowq_engine::scan::Scanner;

use crate::commands::CommandResult;
use crate::commands::open_ledger;

/// Options controlling how windows are discovered.
#[derive(clap::Args, Debug, Default)]
pub struct ScanOptions {
    /// The directory to scan; overrides configuration.
    #[clap(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Restricts the scan to the given groups.
    #[clap(short, long, value_delimiter = ',', value_name = "GROUP")]
    pub groups: Vec<String>,

    /// Queues every window matching the directory layout without checking
    /// its input files.
    #[clap(long)]
    pub skip_validation: bool,
}

impl ScanOptions {
    /// Builds the scanner described by the options.
    pub fn scanner(&self, config: &Config) -> Result<Scanner> {
        let mut scanner = Scanner::new(&config.scan)
            .context("failed to create scanner")?
            .with_groups(self.groups.iter().cloned())
            .skip_validation(self.skip_validation);

        if let Some(root) = &self.root {
            scanner = scanner.with_root(root);
        }

        Ok(scanner)
    }
}

/// Arguments to the `scan` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The scan options.
    #[command(flatten)]
    pub options: ScanOptions,

    /// Clears the ledger before scanning.
    #[clap(long)]
    pub clear: bool,
}

/// The main function for the `scan` subcommand.
pub fn scan(args: Args, config: Config) -> CommandResult<()> {
    let mut ledger = open_ledger(&config)?;
    if args.clear {
        ledger.clear().context("failed to clear the ledger")?;
    }

    let scanner = args.options.scanner(&config)?;
    let count = scanner
        .scan_into_ledger(&mut ledger)
        .context("failed to queue windows")?;

    println!(
        "queued {count} window(s) from `{root}`",
        root = scanner.root().display()
    );
    Ok(())
}
