//! On-disk configuration: a small JSON file in the platform config directory,
//! overridable by environment variables, both overridable in turn by CLI
//! flags (applied by `main.rs` after `Config::load()`).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ATDEV_PORT, DEFAULT_NETSIO_PORT};
use crate::serial::{CommandLine, ProceedLine};

/// Resolved hub configuration: config-file defaults, environment overrides,
/// with CLI flags applied last by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP port NetSIO peripherals connect to.
    pub netsio_port: u16,
    /// TCP port the emulator's custom-device channel connects to.
    pub atdev_port: u16,
    /// Serial device path, if the serial backend is in use instead of UDP.
    pub serial_port: Option<String>,
    /// UART line carrying the SIO COMMAND signal (serial backend only).
    pub command_line: CommandLine,
    /// UART line carrying the SIO PROCEED signal (serial backend only).
    pub proceed_line: ProceedLine,
    /// Info-level logging.
    pub verbose: bool,
    /// Debug-level logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            netsio_port: DEFAULT_NETSIO_PORT,
            atdev_port: DEFAULT_ATDEV_PORT,
            serial_port: None,
            command_line: CommandLine::default(),
            proceed_line: ProceedLine::default(),
            verbose: false,
            debug: false,
        }
    }
}

impl Config {
    /// Platform config directory for this application, creating it if
    /// necessary. Honors `NETSIO_HUB_CONFIG_DIR` for tests and overrides.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("NETSIO_HUB_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir().context("could not determine platform config directory")?.join("netsio-hub")
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating config directory {}", dir.display()))?;
        Ok(dir)
    }

    fn file_path(config_dir: Option<&PathBuf>) -> Result<PathBuf> {
        match config_dir {
            Some(dir) => Ok(dir.join("config.json")),
            None => Ok(Self::config_dir()?.join("config.json")),
        }
    }

    /// Load from `path` if given, otherwise the platform config directory;
    /// falls back to built-in defaults if no file exists. Environment
    /// variable overrides are applied on top.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let file_path = Self::file_path(path)?;
        let mut config = if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .with_context(|| format!("reading config file {}", file_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing config file {}", file_path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("NETSIO_HUB_NETSIO_PORT") {
            if let Ok(port) = port.parse() {
                self.netsio_port = port;
            }
        }
        if let Ok(port) = std::env::var("NETSIO_HUB_ATDEV_PORT") {
            if let Ok(port) = port.parse() {
                self.atdev_port = port;
            }
        }
        if let Ok(path) = std::env::var("NETSIO_HUB_SERIAL_PORT") {
            self.serial_port = Some(path);
        }
        if let Ok(verbose) = std::env::var("NETSIO_HUB_VERBOSE") {
            self.verbose = verbose == "1" || verbose.eq_ignore_ascii_case("true");
        }
        if let Ok(debug) = std::env::var("NETSIO_HUB_DEBUG") {
            self.debug = debug == "1" || debug.eq_ignore_ascii_case("true");
        }
    }

    /// Persist the current configuration to `path`, or the platform config
    /// directory if `None`.
    pub fn save(&self, path: Option<&PathBuf>) -> Result<()> {
        let file_path = Self::file_path(path)?;
        let json = serde_json::to_string_pretty(self).context("serializing config")?;
        fs::write(&file_path, json).with_context(|| format!("writing config file {}", file_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_ports() {
        let config = Config::default();
        assert_eq!(config.netsio_port, DEFAULT_NETSIO_PORT);
        assert_eq!(config.atdev_port, DEFAULT_ATDEV_PORT);
        assert!(config.serial_port.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.netsio_port = 12345;
        config.serial_port = Some("/dev/ttyUSB0".to_string());
        config.save(Some(&path)).expect("save");

        let loaded = Config::load(Some(&path)).expect("load");
        assert_eq!(loaded.netsio_port, 12345);
        assert_eq!(loaded.serial_port.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("does-not-exist.json");
        let loaded = Config::load(Some(&path)).expect("load falls back to defaults");
        assert_eq!(loaded.netsio_port, DEFAULT_NETSIO_PORT);
    }
}
