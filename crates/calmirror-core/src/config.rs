//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/calmirror/config.toml)
//! 3. Environment variables (CALMIRROR_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::scope::{DateWindow, FetchScope, Scope};

/// Environment variable prefix
const ENV_PREFIX: &str = "CALMIRROR";

/// Shortest allowed periodic sync interval
pub const MIN_PERIODIC_INTERVAL_SECS: u64 = 60;

/// Longest allowed debounce delay
pub const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Largest event window reach, in either direction
pub const MAX_WINDOW_DAYS: u32 = 36_500;

/// A setting failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid value for '{field}': {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Sync coordinator settings (the `[sync]` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Resync when the source reports a change
    pub notification_sync_enabled: bool,
    /// Resync on a fixed interval
    pub periodic_sync_enabled: bool,
    pub periodic_interval_secs: u64,
    /// Quiet period after the last change notice before a cycle runs
    pub debounce_ms: u64,
    pub max_retry_attempts: u32,
    /// Retry `n` waits `n * retry_base_delay_ms`
    pub retry_base_delay_ms: u64,
    /// Calendar/list ids to mirror; absent means all
    pub calendars: Option<Vec<String>>,
    pub sync_events: bool,
    pub sync_reminders: bool,
    pub event_window_past_days: u32,
    pub event_window_future_days: u32,
    /// Keys per delete statement inside a reconciliation transaction
    pub batch_size: usize,
    /// How long to wait for an access answer before treating it as denied
    pub permission_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            notification_sync_enabled: true,
            periodic_sync_enabled: true,
            periodic_interval_secs: 900,
            debounce_ms: 1500,
            max_retry_attempts: 3,
            retry_base_delay_ms: 2000,
            calendars: None,
            sync_events: true,
            sync_reminders: true,
            event_window_past_days: 30,
            event_window_future_days: 365,
            batch_size: 500,
            permission_timeout_secs: 120,
        }
    }
}

impl SyncSettings {
    /// Check every field, reporting the first offender
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.periodic_interval_secs < MIN_PERIODIC_INTERVAL_SECS {
            return Err(ConfigError::new(
                "periodic_interval_secs",
                format!("must be at least {MIN_PERIODIC_INTERVAL_SECS} seconds"),
            ));
        }
        if self.debounce_ms == 0 || self.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(ConfigError::new(
                "debounce_ms",
                format!("must be between 1 and {MAX_DEBOUNCE_MS}"),
            ));
        }
        if self.retry_base_delay_ms == 0 {
            return Err(ConfigError::new("retry_base_delay_ms", "must be greater than 0"));
        }
        if matches!(&self.calendars, Some(ids) if ids.is_empty()) {
            return Err(ConfigError::new(
                "calendars",
                "an empty list would mirror nothing; omit the key to mirror all calendars",
            ));
        }
        if !self.sync_events && !self.sync_reminders {
            return Err(ConfigError::new(
                "sync_events",
                "at least one of sync_events or sync_reminders must be enabled",
            ));
        }
        if self.event_window_past_days > MAX_WINDOW_DAYS {
            return Err(ConfigError::new(
                "event_window_past_days",
                format!("must be at most {MAX_WINDOW_DAYS} days"),
            ));
        }
        if self.event_window_future_days == 0 || self.event_window_future_days > MAX_WINDOW_DAYS {
            return Err(ConfigError::new(
                "event_window_future_days",
                format!("must be between 1 and {MAX_WINDOW_DAYS} days"),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::new("batch_size", "must be greater than 0"));
        }
        if self.permission_timeout_secs == 0 {
            return Err(ConfigError::new("permission_timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn with_periodic_sync(mut self, enabled: bool) -> Self {
        self.periodic_sync_enabled = enabled;
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_secs = interval.as_secs();
        self
    }

    pub fn with_notification_sync(mut self, enabled: bool) -> Self {
        self.notification_sync_enabled = enabled;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_calendars(mut self, calendars: Option<Vec<String>>) -> Self {
        self.calendars = calendars;
        self
    }

    pub fn with_permission_timeout(mut self, timeout: Duration) -> Self {
        self.permission_timeout_secs = timeout.as_secs();
        self
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay().saturating_mul(attempt)
    }

    /// Calendar filter
    pub fn scope(&self) -> Scope {
        Scope::from_filter(self.calendars.as_deref())
    }

    /// Fetch scope for a cycle starting at `now`
    pub fn fetch_scope(&self, now: DateTime<Utc>) -> FetchScope {
        FetchScope::new(
            self.scope(),
            Some(DateWindow::around(
                now,
                self.event_window_past_days,
                self.event_window_future_days,
            )),
        )
    }

    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_bool("PERIODIC_SYNC") {
            self.periodic_sync_enabled = val;
        }
        if let Some(val) = env_parse::<u64>("PERIODIC_INTERVAL") {
            self.periodic_interval_secs = val;
        }
        if let Some(val) = env_bool("NOTIFICATION_SYNC") {
            self.notification_sync_enabled = val;
        }
        if let Some(val) = env_parse::<u32>("MAX_RETRIES") {
            self.max_retry_attempts = val;
        }
        if let Ok(val) = std::env::var(format!("{}_CALENDARS", ENV_PREFIX)) {
            self.calendars = parse_calendar_list(&val);
        }
    }
}

/// Parse a comma separated id list; blank means all calendars
pub fn parse_calendar_list(value: &str) -> Option<Vec<String>> {
    let ids: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .map(|val| val.eq_ignore_ascii_case("true") || val == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let key = format!("{}_{}", ENV_PREFIX, name);
    let val = std::env::var(&key).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {}: '{}' is not a valid value", key, val);
            None
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite mirror)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Install a log subscriber even when CALMIRROR_LOG is unset
    #[serde(default = "default_true")]
    pub logging_enabled: bool,

    /// Sync coordinator settings
    #[serde(default)]
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_file: None,
            logging_enabled: true,
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CALMIRROR_DATA_DIR, CALMIRROR_PERIODIC_SYNC, ...)
    /// 2. Config file (~/.config/calmirror/config.toml or CALMIRROR_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from the `--config` path when given, the default location otherwise
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Some(val) = env_bool("LOGGING_ENABLED") {
            self.logging_enabled = val;
        }

        self.sync.apply_env_overrides();
    }

    /// Validate every setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CALMIRROR_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calmirror")
            .join("config.toml")
    }

    /// Get the path to the SQLite mirror
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("calmirror.db")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calmirror")
}

fn default_true() -> bool {
    true
}
