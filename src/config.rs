//! Configuration for the heartbeat agent.
//!
//! [`Settings`] is what the editor integration provides (API key, endpoint,
//! flags, heartbeat interval). [`Config`] wraps it with the agent's own
//! knobs: where state lives, how the queue and dispatcher behave.

use crate::core::debounce::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_IDLE_WINDOW_SECS};
use crate::dispatch::backoff::BackoffPolicy;
use crate::queue::DEFAULT_SOFT_CAP;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Public endpoint of the tracking service.
pub const DEFAULT_API_URL: &str = "https://api.wakatime.com/api/v1";

/// Default heartbeat CLI binary, resolved through `PATH`.
pub const DEFAULT_CLI_PATH: &str = "wakatime-cli";

/// Environment variable that overrides the configured API key.
pub const API_KEY_ENV: &str = "EDITOR_HEARTBEAT_API_KEY";

/// Longest accepted heartbeat interval (one day).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

/// Settings supplied by the editor integration.
///
/// Read-only to the core; a changed value arrives as an explicit reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: Option<String>,
    /// Endpoint override; `None` means the public endpoint
    pub api_url: Option<String>,
    pub debug: bool,
    pub metrics: bool,
    /// Minimum seconds between heartbeats for the same file
    pub heartbeat_interval: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: None,
            debug: false,
            metrics: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl Settings {
    /// Endpoint to deliver to.
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    /// API key, if one is set and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub settings: Settings,

    /// Heartbeat CLI invoked by the process transmitter
    pub cli_path: PathBuf,

    /// Plugin identifier reported with each heartbeat
    pub plugin: String,

    /// Directory for the queue journal, status and stats
    pub data_path: PathBuf,

    /// Pending heartbeats kept before the oldest are shed
    pub queue_soft_cap: usize,

    /// Heartbeats per transmission
    pub batch_size: usize,

    /// Cadence of the dispatcher when nothing wakes it earlier
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Bound on the final flush at shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Retry delays after transient failures
    pub backoff: BackoffPolicy,

    /// Debounce entries idle this long are pruned
    #[serde(with = "duration_serde")]
    pub debounce_idle_window: Duration,

    /// How often a running agent checks the config file for changes
    #[serde(with = "duration_serde")]
    pub config_poll: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("editor-heartbeat");

        Self {
            settings: Settings::default(),
            cli_path: PathBuf::from(DEFAULT_CLI_PATH),
            plugin: format!("editor-heartbeat/{}", env!("CARGO_PKG_VERSION")),
            data_path: data_dir,
            queue_soft_cap: DEFAULT_SOFT_CAP,
            batch_size: 25,
            flush_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            debounce_idle_window: Duration::from_secs(DEFAULT_IDLE_WINDOW_SECS),
            config_poll: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is absent.
    ///
    /// The API key environment variable overrides the file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.settings.api_key = Some(key);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("editor-heartbeat")
            .join("config.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_path.join("queue.jsonl")
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_path.join("status.json")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.queue_soft_cap == 0 {
            return Err(ConfigError::Invalid(
                "queue_soft_cap must be at least 1".into(),
            ));
        }
        if self.settings.heartbeat_interval == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be at least 1 second".into(),
            ));
        }
        if self.settings.heartbeat_interval > MAX_HEARTBEAT_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval must be at most {MAX_HEARTBEAT_INTERVAL_SECS} seconds"
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush_interval must be positive".into(),
            ));
        }
        self.backoff
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as whole seconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.settings.heartbeat_interval, 120);
        assert_eq!(config.settings.api_url(), DEFAULT_API_URL);
        assert_eq!(config.cli_path, PathBuf::from("wakatime-cli"));
        assert_eq!(config.queue_soft_cap, DEFAULT_SOFT_CAP);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"settings": {"api_key": "waka_123", "heartbeat_interval": 60}, "batch_size": 10}"#,
        )
        .unwrap();
        assert_eq!(config.settings.api_key(), Some("waka_123"));
        assert_eq!(config.settings.heartbeat_interval, 60);
        assert!(!config.settings.debug);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_blank_api_key_is_none() {
        let settings = Settings {
            api_key: Some("   ".into()),
            ..Settings::default()
        };
        assert_eq!(settings.api_key(), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.settings.heartbeat_interval = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.settings.heartbeat_interval = MAX_HEARTBEAT_INTERVAL_SECS;
        assert!(config.validate().is_ok());
        config.settings.heartbeat_interval = 10_000_000_000_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_interval_in_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("heartbeat-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            &path,
            r#"{"settings": {"heartbeat_interval": 18446744073709551615}}"#,
        )
        .unwrap();

        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("heartbeat-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");

        let mut config = Config::default();
        config.settings.api_url = Some("https://hackatime.example/api/v1".into());
        config.batch_size = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.settings.api_url(), "https://hackatime.example/api/v1");
        assert_eq!(loaded.batch_size, 7);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir()
            .join(format!("heartbeat-missing-{}", uuid::Uuid::new_v4()))
            .join("config.json");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.batch_size, 25);
    }
}
