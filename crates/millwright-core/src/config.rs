//! Millwright configuration system.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MillwrightError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MillwrightConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-job rate limits, e.g. `"sensors.aggregate" = "10/m"`.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, String>,
    #[serde(default)]
    pub maintenance_windows: Vec<MaintenanceWindowConfig>,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl MillwrightConfig {
    /// Load config from the default path (~/.millwright/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MillwrightError::Config(format!("Failed to read config: {e}")))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MillwrightError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MillwrightError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Millwright home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".millwright")
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.check_interval_secs == 0 {
            return Err(MillwrightError::Config(
                "scheduler.check_interval_secs must be at least 1".into(),
            ));
        }
        if self.retry.backoff_cap_secs < self.retry.initial_backoff_secs {
            return Err(MillwrightError::Config(
                "retry.backoff_cap_secs must not be below retry.initial_backoff_secs".into(),
            ));
        }
        Ok(())
    }
}

/// How interval schedules pick their next slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalAnchor {
    /// `now + interval`, drifting by however long each execution took.
    Now,
    /// `previous next_run_at + k * interval`, a fixed cadence.
    #[default]
    Previous,
}

/// Scheduler loop and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub interval_anchor: IntervalAnchor,
    /// Hold low-priority one-shot tasks until a maintenance window opens.
    #[serde(default)]
    pub defer_low_priority_to_maintenance: bool,
}

fn default_db_path() -> String { "~/.millwright/schedules.db".into() }
fn default_check_interval() -> u64 { 30 }

impl SchedulerConfig {
    /// `db_path` with `~` and environment variables expanded.
    pub fn expanded_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.db_path).map_or_else(
            |_| self.db_path.clone(),
            |expanded| expanded.into_owned(),
        ))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            check_interval_secs: default_check_interval(),
            interval_anchor: IntervalAnchor::default(),
            defer_low_priority_to_maintenance: false,
        }
    }
}

/// Default retry policy attached to every dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_backoff_step")]
    pub backoff_step_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 0 }
fn default_backoff_step() -> u64 { 60 }
fn default_backoff_cap() -> u64 { 600 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff(),
            backoff_step_secs: default_backoff_step(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

/// A maintenance window as written in config: `"HH:MM"` times, days 0 = Monday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindowConfig {
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    pub start: String,
    pub end: String,
}

/// Remote broker settings. No URL means the in-process broker is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

fn default_broker_timeout() -> u64 { 10 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_broker_timeout(),
        }
    }
}
