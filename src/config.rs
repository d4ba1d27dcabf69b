//! # Configuration Management
//!
//! This module handles loading and saving the `tide-light.toml` file. Only the
//! `[location]` section is read by the tide core (through the
//! [`ConfigBridge`](crate::bridge::ConfigBridge)); the remaining sections tune the
//! cache, the scheduler and the display loop.

use crate::tide_data::KARTVERKET_API;
use crate::Location;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Default configuration file name, relative to the working directory.
pub const CONFIG_FILE: &str = "tide-light.toml";

/// Errors raised while reading or writing the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config IO: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("config encode: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Application configuration loaded from tide-light.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Tide station position
    pub location: LocationConfig,
    /// Event cache settings
    pub cache: CacheConfig,
    /// Update scheduler timing
    pub scheduler: SchedulerSettings,
    /// LED strip and status output
    pub display: DisplayConfig,
    /// Tide API endpoint
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// JSON file holding the cached tide events
    pub path: String,
    /// Events older than this many days are pruned (0 = keep everything)
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Days between periodic coverage checks
    pub interval_days: u32,
    /// Days of future data the cache must cover
    pub lookahead_days: u32,
    /// Days of history requested on a full fetch
    pub lookback_days: u32,
    pub fetch_timeout_secs: u64,
    /// Retries after a failed fetch before waiting for the next periodic check
    pub max_retries: u32,
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
    /// How often the config file is checked for changes
    pub config_poll_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Number of LEDs on the strip, including the two direction indicators
    pub led_count: usize,
    /// Render loop period in milliseconds
    pub tick_ms: u64,
    /// Half-period of the "no data" blink in milliseconds
    pub blink_ms: u64,
    /// Seconds between status reports
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        // Tromsø
        LocationConfig {
            latitude: 69.966,
            longitude: 23.272,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: "tide_cache.json".to_string(),
            retention_days: 2,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            interval_days: 7,
            lookahead_days: 7,
            lookback_days: 1,
            fetch_timeout_secs: 30,
            max_retries: 5,
            retry_initial_secs: 60,
            retry_max_secs: 3600,
            config_poll_secs: 2,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            led_count: 60,
            tick_ms: 100,
            blink_ms: 500,
            status_interval_secs: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: KARTVERKET_API.to_string(),
        }
    }
}

impl Config {
    /// Configured tide location
    pub fn location(&self) -> Location {
        Location::new(self.location.latitude, self.location.longitude)
    }

    pub fn set_location(&mut self, location: Location) {
        self.location.latitude = location.latitude;
        self.location.longitude = location.longitude;
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.display.status_interval_secs.max(1))
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.config_poll_secs.max(1))
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::try_load_from_path(&path) {
            Ok(config) => {
                info!(location = %config.location(), "loaded configuration");
                config
            }
            Err(ConfigError::Io(_)) => {
                info!(
                    path = %path.as_ref().display(),
                    "no config file found, using default configuration"
                );
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "invalid config file, using default configuration");
                Self::default()
            }
        }
    }

    /// Load configuration, reporting any failure instead of falling back.
    pub fn try_load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save configuration to `path` through a temporary file, so a reader never
    /// sees a half-written file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.location(), Location::new(69.966, 23.272));
        assert_eq!(config.cache.path, "tide_cache.json");
        assert_eq!(config.scheduler.interval_days, 7);
        assert_eq!(config.scheduler.lookahead_days, 7);
        assert_eq!(config.display.led_count, 60);
        assert_eq!(config.api.base_url, KARTVERKET_API);
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.set_location(Location::new(59.9, 10.7));
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [location]
            latitude = 51.5
            longitude = -0.1

            [scheduler]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(parsed.location(), Location::new(51.5, -0.1));
        assert_eq!(parsed.scheduler.max_retries, 2);
        assert_eq!(parsed.scheduler.interval_days, 7);
        assert_eq!(parsed.display, DisplayConfig::default());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let config = Config::load_from_path("/nonexistent/path");
        // Should fallback to default
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "location = 12").unwrap();

        assert!(matches!(
            Config::try_load_from_path(&path),
            Err(ConfigError::Decode(_))
        ));
        assert_eq!(Config::load_from_path(&path), Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = Config::default();
        config.set_location(Location::new(59.9, 10.7));
        config.save_to_path(&path).unwrap();

        assert_eq!(Config::try_load_from_path(&path).unwrap(), config);
    }
}
