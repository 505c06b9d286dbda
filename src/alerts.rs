//! Operator alert channel.
//!
//! The engine recovers from transient failures on its own and only reaches
//! for an [`AlertSink`] when a human should look: repeated flush failures,
//! corrupt datasets, failed backups and recovery files written on shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FlushFailing,
    CorruptData,
    BackupFailed,
    RecoveryWritten,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            at,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: Alert);
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn alert(&self, alert: Alert) {
        error!(kind = ?alert.kind, at = %alert.at, "{}", alert.message);
    }
}

/// Keeps alerts in memory, e.g. for a command that shows recent problems.
#[derive(Debug, Default)]
pub struct MemoryAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock().await)
    }

    pub async fn kinds(&self) -> Vec<AlertKind> {
        self.alerts.lock().await.iter().map(|alert| alert.kind).collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlerts {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
