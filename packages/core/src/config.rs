//! Runtime configuration.
//!
//! Configuration is a small JSON document. Every field has a default, so an
//! empty object (or no file at all) yields a working setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, IoResultExt, Result};

/// How long to wait for a drive to show up before giving up (milliseconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Pause between two checks of the connection signal (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// File name looked up under the user configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Enable the filesystem driver's write-back cache after mounting.
    pub write_back_cache: bool,
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            write_back_cache: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Poll interval, never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Parses the log level, falling back to `Info` for unknown names.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        serde_json::from_str(&content).context(ConfigParseSnafu { path })
    }

    /// Loads the explicit file if given, else the default location if it
    /// exists, else the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// `<config_dir>/usbmount/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("usbmount").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert!(config.write_back_cache);
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_load_partial_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{"connect_timeout_ms": 500, "log_level": "debug"}"#)
            .unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.connect_timeout_ms, 500);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{not json").unwrap();

        let err = Config::load(temp_file.path()).unwrap_err();
        assert!(matches!(err, crate::Error::ConfigParse { .. }));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_or_default(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, crate::Error::ConfigRead { .. }));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = Config {
            poll_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
