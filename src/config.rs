//! Implementation of configuration loading.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use windowq_engine::Config;

/// The configuration file read when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "windowq.toml";

/// Reads a configuration file from the specified path.
pub fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).with_context(|| {
        format!(
            "failed to read configuration file `{path}`",
            path = path.display()
        )
    })?;
    let config: Config = toml::from_str(&text).with_context(|| {
        format!(
            "failed to parse configuration file `{path}`",
            path = path.display()
        )
    })?;
    Ok(config)
}

/// Loads and validates the configuration.
///
/// An explicit path must exist. Otherwise `windowq.toml` in the current
/// directory is read if present and the defaults are used if not.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => read_config(path)?,
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.is_file() {
                read_config(path)?
            } else {
                debug!("no configuration file found; using the default configuration");
                Config::default()
            }
        }
    };

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("windowq.toml");

        let mut config = Config::default();
        config.devices.count = Some(2);
        config.scheduler.poll_interval_ms = 100;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let read = load_config(Some(&path)).unwrap();
        assert_eq!(read.devices.count, Some(2));
        assert_eq!(read.scheduler.poll_interval_ms, 100);
    }

    #[test]
    fn invalid_configuration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("windowq.toml");
        std::fs::write(&path, "[scheduler]\npoll_interval_ms = 0\n").unwrap();

        let e = load_config(Some(&path)).unwrap_err();
        assert!(format!("{e:?}").contains("poll_interval_ms"), "{e:?}");

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
