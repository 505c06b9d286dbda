use crate::core::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
///
/// Durations are kept as plain integers so the struct round-trips through a
/// JSON config file; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory holding one file per dataset
    pub data_dir: PathBuf,

    /// Directory holding one sub-directory per backup. Defaults to
    /// `<data_dir>/backups` when unset.
    pub backup_dir: Option<PathBuf>,

    /// Seconds between scheduled flushes
    pub flush_interval_secs: u64,

    /// Seconds between scheduled cleanup ticks
    pub cleanup_interval_secs: u64,

    /// Successful flushes between backups
    pub backup_interval_saves: u32,

    /// Backups younger than this are never pruned
    pub retention_days: u32,

    /// Minimum number of backups that survive pruning
    pub min_backups_to_keep: usize,

    /// Upper bound on waiting for a dataset lock
    pub lock_timeout_ms: u64,

    /// Upper bound on copying one backup set
    pub copy_timeout_ms: u64,

    /// Consecutive flush failures before the operator is alerted
    pub alert_after_failures: u32,

    /// Maximum characters kept from message bodies
    pub snippet_max_chars: usize,

    /// Pending messages older than this are dropped by the cleanup tick
    pub pending_ttl_hours: u64,

    /// Offset of the local day boundary from UTC
    pub utc_offset_minutes: i32,

    /// External files (rendered reports) copied into every backup
    pub report_artifacts: Vec<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backup_dir: None,
            flush_interval_secs: 15,
            cleanup_interval_secs: 60 * 60,
            backup_interval_saves: 20,
            retention_days: 30,
            min_backups_to_keep: 50,
            lock_timeout_ms: 10_000,
            copy_timeout_ms: 30_000,
            alert_after_failures: 3,
            snippet_max_chars: 200,
            pending_ttl_hours: 7 * 24,
            utc_offset_minutes: 0,
            report_artifacts: Vec::new(),
        }
    }
}

impl LedgerConfig {
    /// Create a configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            LedgerError::Config(format!("Failed to read config '{}': {}", path.display(), err))
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|err| {
            LedgerError::Config(format!("Failed to parse config '{}': {}", path.display(), err))
        })?;
        config.validate().map_err(LedgerError::Config)?;
        Ok(config)
    }

    /// Set the backup directory
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Set the flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_secs = interval.as_secs();
        self
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_secs = interval.as_secs();
        self
    }

    /// Set how many successful flushes trigger a backup
    pub fn backup_interval_saves(mut self, saves: u32) -> Self {
        self.backup_interval_saves = saves;
        self
    }

    /// Set the backup retention window
    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Set the minimum number of backups to keep
    pub fn min_backups_to_keep(mut self, count: usize) -> Self {
        self.min_backups_to_keep = count;
        self
    }

    /// Set the lock acquisition timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the backup copy timeout
    pub fn copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the consecutive-failure alert threshold
    pub fn alert_after_failures(mut self, failures: u32) -> Self {
        self.alert_after_failures = failures;
        self
    }

    /// Set the snippet length bound
    pub fn snippet_max_chars(mut self, chars: usize) -> Self {
        self.snippet_max_chars = chars;
        self
    }

    /// Set the pending-message time to live
    pub fn pending_ttl_hours(mut self, hours: u64) -> Self {
        self.pending_ttl_hours = hours;
        self
    }

    /// Set the local day boundary offset
    pub fn utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// Add an external report file to every backup
    pub fn report_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_artifacts.push(path.into());
        self
    }

    pub fn resolved_backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn copy_wait(&self) -> Duration {
        Duration::from_millis(self.copy_timeout_ms)
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.pending_ttl_hours as i64)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("data_dir cannot be empty".to_string());
        }

        if self.flush_interval_secs == 0 {
            return Err("flush_interval_secs must be > 0".to_string());
        }

        if self.cleanup_interval_secs == 0 {
            return Err("cleanup_interval_secs must be > 0".to_string());
        }

        if self.backup_interval_saves == 0 {
            return Err("backup_interval_saves must be > 0".to_string());
        }

        if self.lock_timeout_ms == 0 {
            return Err("lock_timeout_ms must be > 0".to_string());
        }

        if self.copy_timeout_ms == 0 {
            return Err("copy_timeout_ms must be > 0".to_string());
        }

        if self.alert_after_failures == 0 {
            return Err("alert_after_failures must be > 0".to_string());
        }

        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err("utc_offset_minutes must be within one day".to_string());
        }

        Ok(())
    }
}
