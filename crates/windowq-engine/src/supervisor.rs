//! Implementation of the process supervisor.
//!
//! The supervisor launches each job as an independent operating system
//! process bound to a single device and classifies its outcome once it has
//! exited. Outcomes are determined solely by the job's output artifact; the
//! exit status of the process is never consulted.

mod handle;

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
pub use handle::ChildHandle;
pub use handle::PidHandle;
pub use handle::ProcessHandle;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::DeviceId;
use crate::WindowDescriptor;
use crate::config::Config;
use crate::config::SupervisorConfig;
use crate::ledger::ActiveRecord;
use crate::ledger::TerminalStatus;

/// Represents an error from launching a job.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The window's location could not be made absolute.
    #[error("failed to resolve window location `{path}`: {source}", path = .path.display())]
    Location {
        /// The window's location.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The window's entry point does not exist.
    #[error("entry point `{path}` does not exist", path = .0.display())]
    MissingEntryPoint(PathBuf),

    /// The entry point could not be made executable.
    #[error("entry point `{path}` is not executable", path = .0.display())]
    NotExecutable(PathBuf),

    /// The permissions of the entry point could not be changed.
    #[error("failed to set permissions of `{path}`: {source}", path = .path.display())]
    Permissions {
        /// The path to the entry point.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// A stale file could not be removed.
    #[error("failed to remove stale file `{path}`: {source}", path = .path.display())]
    Cleanup {
        /// The path to the stale file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The job log could not be created.
    #[error("failed to create job log `{path}`: {source}", path = .path.display())]
    LogFile {
        /// The path to the log file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The process could not be spawned.
    #[error("failed to spawn `{path}`: {source}", path = .path.display())]
    Spawn {
        /// The path to the entry point.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The process exited before the end of the launch grace period.
    #[error("job process {pid} exited within {grace:?} of launch")]
    ExitedEarly {
        /// The process id.
        pid: u32,
        /// The launch grace period.
        grace: Duration,
    },
}

impl LaunchError {
    /// Gets the id of the process that was spawned, if any.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::ExitedEarly { pid, .. } if *pid != 0 => Some(*pid),
            _ => None,
        }
    }
}

/// The observed state of an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job process is still running.
    Running,
    /// The job process has exited with the given classification.
    Terminal(TerminalStatus),
}

/// A job bound to a device with a live process handle.
#[derive(Debug)]
pub struct ActiveJob {
    /// The window being executed.
    pub window: WindowDescriptor,
    /// The device bound to the job.
    pub device: DeviceId,
    /// The handle to the job process.
    pub handle: Box<dyn ProcessHandle>,
    /// When the job was launched.
    pub started: DateTime<Utc>,
}

impl ActiveJob {
    /// Gets the persisted projection of the job.
    pub fn record(&self) -> ActiveRecord {
        ActiveRecord::new(
            self.window.clone(),
            self.device,
            self.handle.pid(),
            self.started,
        )
    }
}

/// The environment captured when a supervisor is created.
///
/// Every job process receives exactly this environment plus its device
/// selection.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSnapshot(Vec<(OsString, OsString)>);

impl EnvironmentSnapshot {
    /// Captures the environment of the current process.
    pub fn capture() -> Self {
        Self(std::env::vars_os().collect())
    }

    /// Gets the captured variables.
    pub fn vars(&self) -> impl Iterator<Item = (&OsString, &OsString)> {
        self.0.iter().map(|(k, v)| (k, v))
    }
}

impl<K, V> FromIterator<(K, V)> for EnvironmentSnapshot
where
    K: Into<OsString>,
    V: Into<OsString>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Launches and classifies job processes.
#[async_trait]
pub trait Supervisor: Send + Sync + fmt::Debug {
    /// Launches a window's job bound to the given device.
    ///
    /// Returns once the job has survived the launch grace period.
    async fn launch(
        &self,
        window: &WindowDescriptor,
        device: DeviceId,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;

    /// Builds a handle for a job process started by a previous session.
    fn adopt(&self, pid: u32, started: DateTime<Utc>) -> Box<dyn ProcessHandle>;

    /// Classifies the outcome of a window's exited job.
    fn classify(&self, window: &WindowDescriptor) -> TerminalStatus;

    /// Polls the outcome of an active job without blocking.
    fn poll_outcome(&self, job: &mut ActiveJob) -> Outcome {
        if job.handle.is_alive() {
            return Outcome::Running;
        }

        Outcome::Terminal(self.classify(&job.window))
    }
}

/// A supervisor that runs jobs as local processes.
#[derive(Debug)]
pub struct LocalSupervisor {
    /// The supervisor configuration.
    config: SupervisorConfig,
    /// The file name of a window's entry point.
    entry_point: String,
    /// The environment variable selecting a job's device.
    device_var: String,
    /// The environment given to every job.
    env: EnvironmentSnapshot,
    /// Matches stale files removed before a launch.
    cleanup: GlobSet,
}

impl LocalSupervisor {
    /// Constructs a new local supervisor.
    ///
    /// Jobs receive the given environment with the configured device variable
    /// added.
    pub fn new(config: &Config, env: EnvironmentSnapshot) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.supervisor.cleanup {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid cleanup pattern `{pattern}`"))?,
            );
        }

        Ok(Self {
            config: config.supervisor.clone(),
            entry_point: config.scan.entry_point.clone(),
            device_var: config.devices.env_var.clone(),
            env,
            cleanup: builder.build().context("failed to build cleanup patterns")?,
        })
    }

    /// Ensures the entry point exists and is executable.
    fn prepare_entry_point(&self, path: &Path) -> Result<(), LaunchError> {
        if !path.is_file() {
            return Err(LaunchError::MissingEntryPoint(path.to_path_buf()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = |path: &Path| {
                fs::metadata(path)
                    .map(|m| m.permissions().mode())
                    .map_err(|e| LaunchError::Permissions {
                        path: path.to_path_buf(),
                        source: e,
                    })
            };

            let current = mode(path)?;
            if current & 0o111 == 0 {
                debug!("adding executable bits to `{path}`", path = path.display());
                fs::set_permissions(path, fs::Permissions::from_mode(current | 0o755)).map_err(
                    |e| LaunchError::Permissions {
                        path: path.to_path_buf(),
                        source: e,
                    },
                )?;

                if mode(path)? & 0o111 == 0 {
                    return Err(LaunchError::NotExecutable(path.to_path_buf()));
                }
            }
        }

        Ok(())
    }

    /// Removes the outputs of any previous attempt.
    fn clean_slate(&self, location: &Path) -> Result<(), LaunchError> {
        let remove = |path: PathBuf| match fs::remove_file(&path) {
            Ok(()) => {
                debug!("removed stale file `{path}`", path = path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LaunchError::Cleanup { path, source: e }),
        };

        remove(location.join(&self.config.output_artifact))?;
        remove(location.join(&self.config.log_file))?;

        if self.cleanup.is_empty() {
            return Ok(());
        }

        let entries = fs::read_dir(location).map_err(|e| LaunchError::Cleanup {
            path: location.to_path_buf(),
            source: e,
        })?;

        for entry in entries.flatten() {
            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            if is_file && self.cleanup.is_match(entry.file_name()) {
                remove(entry.path())?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Supervisor for LocalSupervisor {
    async fn launch(
        &self,
        window: &WindowDescriptor,
        device: DeviceId,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        // The entry point is spawned after changing into the location, so it
        // must not be relative to the scheduler's directory
        let location =
            std::path::absolute(window.location()).map_err(|e| LaunchError::Location {
                path: window.location().to_path_buf(),
                source: e,
            })?;
        let location = location.as_path();
        let entry_point = location.join(&self.entry_point);
        self.prepare_entry_point(&entry_point)?;
        self.clean_slate(location)?;

        let log_path = location.join(&self.config.log_file);
        let log = File::create(&log_path).map_err(|e| LaunchError::LogFile {
            path: log_path.clone(),
            source: e,
        })?;
        let log_err = log.try_clone().map_err(|e| LaunchError::LogFile {
            path: log_path.clone(),
            source: e,
        })?;

        let mut command = Command::new(&entry_point);
        command
            .current_dir(location)
            .env_clear()
            .envs(self.env.vars())
            .env(&self.device_var, device.to_string())
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);

        // Keep interrupts delivered to the scheduler away from the job
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| LaunchError::Spawn {
            path: entry_point.clone(),
            source: e,
        })?;

        let grace = self.config.launch_grace();
        let Some(mut handle) = ChildHandle::new(child) else {
            return Err(LaunchError::ExitedEarly { pid: 0, grace });
        };

        let pid = handle.pid();
        info!(
            pid,
            device,
            "spawned job process for window `{window}`"
        );

        tokio::time::sleep(grace).await;
        if !handle.is_alive() {
            warn!(
                pid,
                "job process for window `{window}` exited during the launch grace period; see \
                 `{log}`",
                log = log_path.display()
            );
            return Err(LaunchError::ExitedEarly { pid, grace });
        }

        Ok(Box::new(handle))
    }

    fn adopt(&self, pid: u32, started: DateTime<Utc>) -> Box<dyn ProcessHandle> {
        Box::new(PidHandle::new(pid, started))
    }

    fn classify(&self, window: &WindowDescriptor) -> TerminalStatus {
        classify_output(
            &window.location().join(&self.config.output_artifact),
            &self.config.success_marker,
        )
    }
}

/// Classifies a job from its output artifact.
///
/// An artifact containing the success marker is a success, an artifact
/// without it is incomplete and a missing artifact is a failure.
pub fn classify_output(artifact: &Path, marker: &str) -> TerminalStatus {
    match fs::read(artifact) {
        Ok(contents) => {
            if String::from_utf8_lossy(&contents).contains(marker) {
                TerminalStatus::Success
            } else {
                TerminalStatus::Incomplete
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => TerminalStatus::Failed,
        Err(e) => {
            warn!(
                "failed to read output artifact `{path}`: {e}",
                path = artifact.display()
            );
            TerminalStatus::Incomplete
        }
    }
}
