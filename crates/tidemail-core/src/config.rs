//! Engine configuration.
//!
//! Loaded from a JSON document. Every field has a default, so an empty
//! object (or a missing file) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TIDEMAIL_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `SQLite` database file.
    pub database_path: PathBuf,
    /// Root directory for raw messages and attachments.
    pub storage_root: PathBuf,
    /// Backfill pacing.
    pub backfill: BackfillConfig,
    /// Delta pacing.
    pub delta: DeltaConfig,
    /// Backfill byte budget.
    pub budget: BudgetConfig,
    /// Session lifecycle.
    pub session: SessionConfig,
    /// External search index.
    pub search: SearchConfig,
    /// Job queue.
    pub jobs: JobsConfig,
    /// Scheduler.
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tidemail");

        Self {
            database_path: data_dir.join("tidemail.db"),
            storage_root: data_dir.join("objects"),
            backfill: BackfillConfig::default(),
            delta: DeltaConfig::default(),
            budget: BudgetConfig::default(),
            session: SessionConfig::default(),
            search: SearchConfig::default(),
            jobs: JobsConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `TIDEMAIL_CONFIG` or the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).map_or_else(Self::default_path, PathBuf::from);
        Self::from_path(&path).await
    }

    /// Default config file location: `<config_dir>/tidemail/config.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tidemail")
            .join("config.json")
    }

    /// Loads the configuration from a file; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn from_path(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            tracing::debug!(?path, "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would stall the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.backfill.window_size == 0 {
            return Err(Error::Config("backfill.window_size must be positive".into()));
        }
        if self.backfill.windows_per_job == 0 {
            return Err(Error::Config(
                "backfill.windows_per_job must be positive".into(),
            ));
        }
        if self.delta.batch_size == 0 {
            return Err(Error::Config("delta.batch_size must be positive".into()));
        }
        if self.budget.window_secs == 0 {
            return Err(Error::Config("budget.window_secs must be positive".into()));
        }
        if self.session.keepalive_secs == 0 || self.session.command_timeout_secs == 0 {
            return Err(Error::Config(
                "session.keepalive_secs and session.command_timeout_secs must be positive".into(),
            ));
        }
        if self.jobs.max_attempts == 0 {
            return Err(Error::Config("jobs.max_attempts must be positive".into()));
        }
        if self.search.rebuild_batch_size == 0 {
            return Err(Error::Config(
                "search.rebuild_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Backfill pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// UIDs per window.
    pub window_size: u32,
    /// Pause between windows.
    pub inter_window_delay_ms: u64,
    /// Windows processed before the job re-enqueues itself.
    pub windows_per_job: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            window_size: 500,
            inter_window_delay_ms: 250,
            windows_per_job: 10,
        }
    }
}

impl BackfillConfig {
    /// Pause between windows.
    #[must_use]
    pub const fn inter_window_delay(&self) -> Duration {
        Duration::from_millis(self.inter_window_delay_ms)
    }
}

/// Delta pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// UIDs per batch.
    pub batch_size: u32,
    /// Pause between batches.
    pub inter_batch_delay_ms: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            inter_batch_delay_ms: 100,
        }
    }
}

impl DeltaConfig {
    /// Pause between batches.
    #[must_use]
    pub const fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

/// Backfill byte budget per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Length of the counting window.
    pub window_secs: u64,
    /// Bytes allowed per window.
    pub max_bytes: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window_secs: 3600,
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

impl BudgetConfig {
    /// Length of the counting window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// NOOP interval while idle.
    pub keepalive_secs: u64,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_delay_ms: u64,
    /// Attempts before a command fails.
    pub max_reconnect_attempts: u32,
    /// Deadline for a single protocol command.
    pub command_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 240,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 5,
            command_timeout_secs: 120,
        }
    }
}

impl SessionConfig {
    /// NOOP interval while idle.
    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// First reconnect delay.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Deadline for a single protocol command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// External search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Typesense base URL; `None` keeps the index in process.
    pub url: Option<String>,
    /// API key sent with every request.
    pub api_key: String,
    /// Collection name.
    pub collection: String,
    /// Messages per batch during a rebuild.
    pub rebuild_batch_size: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: String::new(),
            collection: "messages".to_string(),
            rebuild_batch_size: 200,
        }
    }
}

/// Job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Idle poll interval.
    pub poll_interval_ms: u64,
    /// Attempts before a job is marked failed.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base_ms: u64,
    /// Retry delay cap.
    pub backoff_max_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_attempts: 5,
            backoff_base_ms: 2000,
            backoff_max_secs: 900,
        }
    }
}

impl JobsConfig {
    /// Idle poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retry delay after the given number of failed attempts (1-based).
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay).min(Duration::from_secs(self.backoff_max_secs))
    }
}

/// Scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduling passes.
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl SchedulerConfig {
    /// Time between scheduling passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backfill.window_size, 500);
        assert_eq!(config.budget.max_bytes, 512 * 1024 * 1024);
        assert!(config.search.url.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"backfill": {"window_size": 100}, "jobs": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.backfill.window_size, 100);
        assert_eq!(config.backfill.windows_per_job, 10);
        assert_eq!(config.jobs.max_attempts, 2);
        assert_eq!(config.jobs.backoff_base_ms, 2000);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut config = Config::default();
        config.backfill.window_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let jobs = JobsConfig::default();
        assert_eq!(jobs.backoff(1), Duration::from_secs(2));
        assert_eq!(jobs.backoff(2), Duration::from_secs(4));
        assert_eq!(jobs.backoff(3), Duration::from_secs(8));
        assert_eq!(jobs.backoff(40), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("tidemail-config-does-not-exist.json");
        let config = Config::from_path(&path).await.unwrap();
        assert_eq!(config, Config::default());
    }
}
