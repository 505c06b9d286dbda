//! The ledger engine ties the pieces together.
//!
//! Reply events are appended to the [`WriteBuffer`] without touching disk.
//! A flush moves the whole buffer into the committed ledger with a single
//! atomic write, and every `backup_interval_saves` successful flushes a
//! backup is taken. Flushes, purges, deletions and backups are serialized by
//! one async mutex so only one of them rewrites the datasets at a time.

mod flush;
mod ops;
mod recovery;

pub use flush::{FlushOutcome, ShutdownOutcome};
pub use ops::{CleanupReport, PurgeReport};

use crate::alerts::{Alert, AlertKind, AlertSink, LogAlerts};
use crate::backup::{BackupRotator, RetentionPolicy};
use crate::buffer::WriteBuffer;
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::core::{LedgerError, RecordId, Result};
use crate::ledger::{FixedOffsetCalendar, LocalCalendar, PendingCache, ResponseRecord};
use crate::roster::Roster;
use crate::storage::{AtomicFileStore, DatasetStore};
use chrono::{DateTime, Utc};
use im::Vector;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

#[derive(Debug, Default)]
struct FlushState {
    saves_since_backup: u32,
    consecutive_failures: u32,
    /// A recovery file was re-ingested and must be removed after the next
    /// successful flush.
    recovery_pending: bool,
    /// Last id mark written to the sequence dataset.
    sequence_saved: RecordId,
}

/// Content of the sequence dataset. Every id below `next_record_id` has been
/// issued, even if the record carrying it was later deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RecordSequence {
    pub(crate) next_record_id: RecordId,
}

pub struct LedgerEngine {
    config: LedgerConfig,
    store: Arc<dyn DatasetStore>,
    clock: Arc<dyn Clock>,
    calendar: Arc<dyn LocalCalendar>,
    alerts: Arc<dyn AlertSink>,
    roster: Arc<Roster>,
    rotator: BackupRotator,
    buffer: WriteBuffer,
    committed: RwLock<Vector<ResponseRecord>>,
    pending: Mutex<PendingCache>,
    flush_state: tokio::sync::Mutex<FlushState>,
}

/// Builder for [`LedgerEngine`]. Anything left unset falls back to the
/// file store in `data_dir`, the system clock, the configured UTC offset and
/// log-only alerts.
pub struct LedgerEngineBuilder {
    config: LedgerConfig,
    store: Option<Arc<dyn DatasetStore>>,
    clock: Option<Arc<dyn Clock>>,
    calendar: Option<Arc<dyn LocalCalendar>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl LedgerEngineBuilder {
    pub fn store(mut self, store: Arc<dyn DatasetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn calendar(mut self, calendar: Arc<dyn LocalCalendar>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Load every dataset, repairing what can be repaired, and return a
    /// ready engine.
    pub async fn open(self) -> Result<LedgerEngine> {
        let config = self.config;
        config.validate().map_err(LedgerError::Config)?;

        let store = match self.store {
            Some(store) => store,
            None => {
                let dir = config.data_dir.clone();
                let lock_wait = config.lock_wait();
                tokio::task::spawn_blocking(move || -> Result<Arc<dyn DatasetStore>> {
                    let store = AtomicFileStore::open(dir, lock_wait)?;
                    store.sweep_stale_temps()?;
                    Ok(Arc::new(store))
                })
                .await??
            }
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let calendar = self.calendar.unwrap_or_else(|| {
            Arc::new(FixedOffsetCalendar::from_minutes(config.utc_offset_minutes))
                as Arc<dyn LocalCalendar>
        });
        let alerts = self
            .alerts
            .unwrap_or_else(|| Arc::new(LogAlerts) as Arc<dyn AlertSink>);

        let rotator = BackupRotator::new(
            config.resolved_backup_dir(),
            store.clone(),
            clock.clone(),
            RetentionPolicy::new(config.retention_days, config.min_backups_to_keep),
            config.copy_wait(),
        )
        .with_artifacts(config.report_artifacts.clone());

        let loaded = recovery::load_state(&store, &rotator, clock.as_ref(), alerts.as_ref()).await?;
        let next_record_id = loaded
            .committed
            .iter()
            .chain(loaded.recovered.iter())
            .map(|record| record.record_id + 1)
            .max()
            .unwrap_or(1)
            .max(loaded.sequence.next_record_id);

        let buffer = WriteBuffer::new(next_record_id);
        let recovered = loaded.recovered.len();
        for record in loaded.recovered {
            buffer.push_existing(record)?;
        }

        info!(
            data = %store.location(crate::core::Dataset::Ledger),
            records = loaded.committed.len(),
            recovered,
            next_record_id,
            pending = loaded.pending.len(),
            "ledger opened"
        );

        Ok(LedgerEngine {
            config,
            store,
            clock,
            calendar,
            alerts,
            roster: Arc::new(loaded.roster),
            rotator,
            buffer,
            committed: RwLock::new(loaded.committed),
            pending: Mutex::new(loaded.pending),
            flush_state: tokio::sync::Mutex::new(FlushState {
                recovery_pending: loaded.recovery_pending,
                sequence_saved: loaded.sequence.next_record_id,
                ..FlushState::default()
            }),
        })
    }
}

impl LedgerEngine {
    pub fn builder(config: LedgerConfig) -> LedgerEngineBuilder {
        LedgerEngineBuilder {
            config,
            store: None,
            clock: None,
            calendar: None,
            alerts: None,
        }
    }

    /// Open with the file store in `config.data_dir` and default services.
    pub async fn open(config: LedgerConfig) -> Result<Self> {
        Self::builder(config).open().await
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn rotator(&self) -> &BackupRotator {
        &self.rotator
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Every flushed record, oldest first. Records still in the buffer are
    /// not included.
    pub fn records(&self) -> Result<Vector<ResponseRecord>> {
        Ok(self.committed.read()?.clone())
    }

    pub fn buffered_len(&self) -> Result<usize> {
        self.buffer.len()
    }

    pub fn pending_len(&self) -> Result<usize> {
        Ok(self.pending.lock()?.len())
    }

    async fn alert(&self, kind: AlertKind, message: impl Into<String>) {
        self.alerts
            .alert(Alert::new(kind, message, self.clock.now()))
            .await;
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DatasetStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref())).await?
    }
}
