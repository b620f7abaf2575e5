//! Implementation of engine configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use globset::Glob;
use serde::Deserialize;
use serde::Serialize;

use crate::DeviceId;
use crate::device::DetectError;
use crate::device::detect_devices;
use crate::device::numbered_devices;

/// The default accelerator device-selection environment variable.
pub const DEFAULT_DEVICE_ENV_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// The placeholder substituted with a stage name in [`ScanConfig::stage_file`].
pub const STAGE_PLACEHOLDER: &str = "{stage}";

/// The default scheduler poll interval, in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// The default bound on waiting for a free device, in seconds (one day).
const DEFAULT_DEVICE_WAIT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// The default launch grace period, in milliseconds.
const DEFAULT_LAUNCH_GRACE_MS: u64 = 2_000;

/// Represents the scheduling engine configuration.
///
/// The configuration is immutable once the scheduler starts; components
/// receive the section they need at construction.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Inventory scan configuration.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Device pool configuration.
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Process supervisor configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Scheduling loop configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Ledger persistence configuration.
    #[serde(default)]
    pub ledger: LedgerConfig,
}

impl Config {
    /// Validates the engine configuration.
    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;
        self.devices.validate()?;
        self.supervisor.validate()?;
        self.scheduler.validate()?;
        self.ledger.validate()?;
        Ok(())
    }
}

/// Represents configuration for the inventory scanner.
///
/// Windows are expected at `<root>/<group>/<category>/<subtype><sep><seq>`
/// where `<sep>` is one of `.`, `_` or `-`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct ScanConfig {
    /// The root directory containing one directory per group.
    pub root: PathBuf,
    /// The two top-level window categories.
    pub categories: Vec<String>,
    /// The recognized window subtypes.
    pub subtypes: Vec<String>,
    /// The file name of the window's executable entry point.
    pub entry_point: String,
    /// The static input files every window must contain.
    pub required_files: Vec<String>,
    /// The execution stages of a window, in order.
    pub stages: Vec<String>,
    /// The staged configuration file name template; `{stage}` is replaced by
    /// each stage name.
    pub stage_file: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("windows"),
            categories: vec!["bound".to_string(), "unbound".to_string()],
            subtypes: vec![
                "coul".to_string(),
                "vdw".to_string(),
                "restraint".to_string(),
            ],
            entry_point: "run.sh".to_string(),
            required_files: vec!["topol.top".to_string(), "conf.gro".to_string()],
            stages: ["em", "nvt", "npt", "prod"]
                .into_iter()
                .map(String::from)
                .collect(),
            stage_file: "{stage}.mdp".to_string(),
        }
    }
}

impl ScanConfig {
    /// Validates the scan configuration.
    pub fn validate(&self) -> Result<()> {
        if self.categories.len() != 2 {
            bail!(
                "scan configuration value `categories` must name exactly two categories (found \
                 {len})",
                len = self.categories.len()
            );
        }

        if self.categories[0] == self.categories[1] {
            bail!("scan configuration value `categories` cannot name the same category twice");
        }

        for name in &self.categories {
            check_name("categories", name)?;
        }

        if self.subtypes.is_empty() {
            bail!("scan configuration value `subtypes` cannot be empty");
        }

        for name in &self.subtypes {
            check_name("subtypes", name)?;
        }

        if self.entry_point.is_empty() {
            bail!("scan configuration value `entry_point` cannot be empty");
        }

        if !self.stages.is_empty() && !self.stage_file.contains(STAGE_PLACEHOLDER) {
            bail!(
                "scan configuration value `stage_file` must contain the `{STAGE_PLACEHOLDER}` \
                 placeholder"
            );
        }

        Ok(())
    }

    /// Gets the staged configuration file names, one per stage.
    pub fn stage_files(&self) -> impl Iterator<Item = String> + '_ {
        self.stages
            .iter()
            .map(|stage| self.stage_file.replace(STAGE_PLACEHOLDER, stage))
    }
}

/// Ensures a configured name can be used as a path component and a ledger
/// field.
fn check_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("scan configuration value `{field}` cannot contain an empty name");
    }

    if name.contains(['/', '\\', '|', '\n']) {
        bail!("scan configuration value `{field}` has invalid name `{name}`");
    }

    Ok(())
}

/// Represents configuration for the device pool.
///
/// At most one of `count` and `ids` may be set; when neither is set, the
/// devices are detected from the device-selection variable or `nvidia-smi`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct DeviceConfig {
    /// The number of devices; devices are numbered from zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// The explicit device ids to schedule on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<DeviceId>>,
    /// The environment variable used to select a device for a job.
    pub env_var: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            count: None,
            ids: None,
            env_var: DEFAULT_DEVICE_ENV_VAR.to_string(),
        }
    }
}

impl DeviceConfig {
    /// Validates the device configuration.
    pub fn validate(&self) -> Result<()> {
        if self.count.is_some() && self.ids.is_some() {
            bail!("device configuration values `count` and `ids` cannot both be set");
        }

        if self.count == Some(0) {
            bail!("device configuration value `count` cannot be zero");
        }

        if let Some(count) = self.count
            && DeviceId::try_from(count).is_err()
        {
            bail!("device configuration value `count` is too large ({count})");
        }

        if let Some(ids) = &self.ids {
            if ids.is_empty() {
                bail!("device configuration value `ids` cannot be empty");
            }

            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id) {
                    bail!("device configuration value `ids` contains device {id} more than once");
                }
            }
        }

        if self.env_var.is_empty() {
            bail!("device configuration value `env_var` cannot be empty");
        }

        Ok(())
    }

    /// Resolves the device ids to schedule on.
    ///
    /// Explicit ids take precedence over a count; otherwise the devices are
    /// detected from the host.
    pub fn resolve(&self) -> Result<Vec<DeviceId>, DetectError> {
        if let Some(ids) = &self.ids {
            let mut ids = ids.clone();
            ids.sort_unstable();
            return Ok(ids);
        }

        if let Some(count) = self.count {
            return numbered_devices(count);
        }

        detect_devices(&self.env_var)
    }
}

/// Represents configuration for the process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct SupervisorConfig {
    /// The output artifact, relative to the window directory, inspected for
    /// the success marker.
    pub output_artifact: String,
    /// The string whose presence in the output artifact marks success.
    pub success_marker: String,
    /// The per-job log file receiving standard output and error.
    pub log_file: String,
    /// The time to wait after spawning before checking that the job is
    /// still alive, in milliseconds.
    pub launch_grace_ms: u64,
    /// Glob patterns of stale files removed from the window directory before
    /// a launch.
    pub cleanup: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_artifact: "prod.log".to_string(),
            success_marker: "Finished mdrun".to_string(),
            log_file: "windowq.log".to_string(),
            launch_grace_ms: DEFAULT_LAUNCH_GRACE_MS,
            cleanup: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Validates the supervisor configuration.
    pub fn validate(&self) -> Result<()> {
        if self.output_artifact.is_empty() {
            bail!("supervisor configuration value `output_artifact` cannot be empty");
        }

        if self.success_marker.is_empty() {
            bail!("supervisor configuration value `success_marker` cannot be empty");
        }

        if self.log_file.is_empty() {
            bail!("supervisor configuration value `log_file` cannot be empty");
        }

        if self.log_file == self.output_artifact {
            bail!(
                "supervisor configuration value `log_file` cannot be the same as \
                 `output_artifact`"
            );
        }

        for pattern in &self.cleanup {
            Glob::new(pattern).with_context(|| {
                format!("supervisor configuration value `cleanup` has invalid glob `{pattern}`")
            })?;
        }

        Ok(())
    }

    /// Gets the launch grace period.
    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }
}

/// Represents configuration for the scheduling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// The interval between scheduling ticks, in milliseconds.
    pub poll_interval_ms: u64,
    /// The maximum time to wait for a device to become free, in seconds.
    pub device_wait_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            device_wait_timeout_secs: DEFAULT_DEVICE_WAIT_TIMEOUT_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Validates the scheduler configuration.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("scheduler configuration value `poll_interval_ms` cannot be zero");
        }

        if self.device_wait_timeout_secs == 0 {
            bail!("scheduler configuration value `device_wait_timeout_secs` cannot be zero");
        }

        Ok(())
    }

    /// Gets the interval between scheduling ticks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Gets the bound on waiting for a free device.
    pub fn device_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.device_wait_timeout_secs)
    }
}

/// Represents configuration for ledger persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct LedgerConfig {
    /// The directory holding the persisted ledger collections.
    pub dir: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".windowq"),
        }
    }
}

impl LedgerConfig {
    /// Validates the ledger configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            bail!("ledger configuration value `dir` cannot be empty");
        }

        Ok(())
    }
}
