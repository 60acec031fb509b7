//! Configuration for the posture agent.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the posture agent.
///
/// Recognized options and defaults:
/// - `threshold_degrees`: deviation above which a sample classifies as
///   forward head posture; controls sensitivity, default chosen empirically.
/// - `neutral_angle_degrees`: calibrated neutral angle; set by `calibrate`.
/// - `min_landmark_visibility`: frames with less confident landmarks drop.
/// - `session_gap_secs` / `resume_weight_secs`: session-break handling for
///   sample weights.
/// - `timezone`: IANA timezone name used to resolve the local calendar day.
/// - `persist_interval_secs`: how often the live aggregate is checkpointed;
///   bounds the sample window a crash can lose.
/// - `sync_interval_secs`: how often pending days are flushed remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Principal identity for aggregate keys. `None` means a device-derived
    /// id is used.
    pub user_id: Option<String>,

    pub threshold_degrees: f64,
    pub neutral_angle_degrees: f64,
    pub min_landmark_visibility: f64,
    pub session_gap_secs: f64,
    pub resume_weight_secs: f64,

    /// IANA timezone name, e.g. "America/Los_Angeles".
    pub timezone: String,

    pub persist_interval_secs: u64,
    pub sync_interval_secs: u64,

    /// Base URL of the remote summary store, if syncing is configured.
    pub remote_url: Option<String>,

    /// Path for storing daily aggregates and stats.
    pub data_path: PathBuf,

    /// Whether measurement is currently paused.
    pub paused: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("posture-agent");

        Self {
            user_id: None,
            threshold_degrees: 15.0,
            neutral_angle_degrees: 0.0,
            min_landmark_visibility: 0.5,
            session_gap_secs: 5.0,
            resume_weight_secs: 0.5,
            timezone: "UTC".to_string(),
            persist_interval_secs: 30,
            sync_interval_secs: 60,
            remote_url: None,
            data_path: data_dir,
            paused: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("posture-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// The configured timezone, parsed.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    /// Where session stats are persisted.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidTimezone(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::InvalidTimezone(tz) => write!(f, "Unknown timezone: {tz}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.threshold_degrees, 15.0);
        assert_eq!(config.neutral_angle_degrees, 0.0);
        assert_eq!(config.timezone, "UTC");
        assert!(!config.paused);
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_timezone_parsing() {
        let mut config = Config::default();
        assert_eq!(config.tz().unwrap(), chrono_tz::UTC);

        config.timezone = "America/Los_Angeles".to_string();
        assert_eq!(config.tz().unwrap(), chrono_tz::America::Los_Angeles);

        config.timezone = "Not/AZone".to_string();
        assert!(config.tz().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.threshold_degrees, config.threshold_degrees);
        assert_eq!(back.timezone, config.timezone);
    }
}
