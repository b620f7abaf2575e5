//! Implementation of windowq CLI commands.

use std::fmt;

use anyhow::Context;
use windowq_engine::Config;
use windowq_engine::ledger::FileStore;
use windowq_engine::ledger::Ledger;
use windowq_engine::scheduler::SchedulerError;

pub mod clear;
pub mod config;
pub mod pause;
pub mod requeue;
pub mod run;
pub mod scan;
pub mod status;

/// The exit code for a general error.
pub const EXIT_ERROR: i32 = 1;

/// The exit code for a run that found no free device in time.
pub const EXIT_DEVICE_WAIT_TIMEOUT: i32 = 3;

/// The exit code for an interrupted run.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Represents an error from a command.
pub enum CommandError {
    /// Scheduling stopped because no device became free in time.
    DeviceWaitTimeout(anyhow::Error),
    /// Scheduling was interrupted by the operator.
    Interrupted(anyhow::Error),
    /// Any other error.
    Other(anyhow::Error),
}

impl CommandError {
    /// Gets the process exit code for the error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DeviceWaitTimeout(_) => EXIT_DEVICE_WAIT_TIMEOUT,
            Self::Interrupted(_) => EXIT_INTERRUPTED,
            Self::Other(_) => EXIT_ERROR,
        }
    }

    /// Gets the underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        match self {
            Self::DeviceWaitTimeout(e) | Self::Interrupted(e) | Self::Other(e) => e,
        }
    }
}

impl fmt::Debug for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.inner(), f)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner(), f)
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(e)
    }
}

impl From<SchedulerError> for CommandError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::DeviceWaitTimeout { .. } => Self::DeviceWaitTimeout(e.into()),
            SchedulerError::Interrupted { .. } => Self::Interrupted(e.into()),
            e => Self::Other(e.into()),
        }
    }
}

/// The result type for commands.
pub type CommandResult<T> = Result<T, CommandError>;

/// Opens the configured ledger for reading and writing.
pub(crate) fn open_ledger(config: &Config) -> anyhow::Result<Ledger> {
    let dir = &config.ledger.dir;
    let store = FileStore::open(dir).with_context(|| {
        format!(
            "failed to create ledger directory `{dir}`",
            dir = dir.display()
        )
    })?;

    Ledger::open(store)
        .with_context(|| format!("failed to open ledger `{dir}`", dir = dir.display()))
}

/// Opens the configured ledger without creating its directory.
pub(crate) fn read_ledger(config: &Config) -> anyhow::Result<Ledger> {
    let dir = &config.ledger.dir;
    Ledger::open(FileStore::open_read_only(dir))
        .with_context(|| format!("failed to read ledger `{dir}`", dir = dir.display()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn exit_codes() {
        let e: CommandError = SchedulerError::DeviceWaitTimeout {
            timeout: Duration::from_secs(1),
            queued: 2,
        }
        .into();
        assert_eq!(e.exit_code(), EXIT_DEVICE_WAIT_TIMEOUT);

        let e: CommandError = SchedulerError::Interrupted { active: 1 }.into();
        assert_eq!(e.exit_code(), EXIT_INTERRUPTED);

        let e: CommandError = anyhow::anyhow!("boom").into();
        assert_eq!(e.exit_code(), EXIT_ERROR);
        assert_eq!(e.to_string(), "boom");
    }
}
