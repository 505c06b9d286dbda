use super::{FlushState, LedgerEngine, RecordSequence};
use crate::alerts::AlertKind;
use crate::backup::BackupEntry;
use crate::core::{Dataset, LedgerError, Result};
use crate::ledger::{ResponseRecord, TriggeringMessage};
use crate::storage::write_json;
use im::Vector;
use std::sync::PoisonError;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records moved from the buffer to disk
    pub flushed: usize,
    /// Ledger size after the flush
    pub total: usize,
    pub pending_saved: bool,
    /// Id of the backup taken after this flush, if one was due and succeeded
    pub backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Flushed(FlushOutcome),
    /// The final flush failed and the buffer was written to the recovery
    /// dataset instead.
    RecoveryWritten { records: usize },
}

impl LedgerEngine {
    /// Flush the buffer now instead of waiting for the next tick.
    ///
    /// On failure nothing is lost: the batch goes back to the front of the
    /// buffer and the next flush retries it.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let mut state = self.flush_state.lock().await;
        self.flush_locked(&mut state)
            .instrument(info_span!("flush"))
            .await
    }

    pub(super) async fn flush_locked(&self, state: &mut FlushState) -> Result<FlushOutcome> {
        // Snapshot everything the flush needs before the batch leaves the
        // buffer, so a poisoned lock cannot strand it.
        let current = self.committed.read()?.clone();
        let pending = self.pending.lock()?.take_dirty_snapshot();
        let batch = match self.buffer.take_all() {
            Ok(batch) => batch,
            Err(err) => {
                if pending.is_some() {
                    self.pending.lock()?.mark_dirty();
                }
                return Err(err);
            }
        };
        if batch.is_empty() && pending.is_none() && !state.recovery_pending {
            return Ok(FlushOutcome {
                flushed: 0,
                total: current.len(),
                pending_saved: false,
                backup: None,
            });
        }

        let total = if batch.is_empty() {
            current.len()
        } else {
            let mut next = current;
            next.extend(batch.iter().cloned());

            let written = match self.save_sequence(state).await {
                Ok(()) => self.write_ledger(next.clone()).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                self.buffer.restore_front(batch)?;
                if pending.is_some() {
                    self.pending.lock()?.mark_dirty();
                }
                return Err(self.flush_failed(state, err).await);
            }

            let total = next.len();
            self.commit(next);
            if state.consecutive_failures > 0 {
                info!(
                    after = state.consecutive_failures,
                    "flush succeeded after failures"
                );
            }
            state.consecutive_failures = 0;
            total
        };

        let pending_saved = match pending {
            Some(messages) => match self.write_pending(messages).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "failed to save pending messages, will retry");
                    self.pending.lock()?.mark_dirty();
                    false
                }
            },
            None => false,
        };

        if state.recovery_pending {
            match self.blocking(|store| store.remove(Dataset::Recovery)).await {
                Ok(_) => {
                    state.recovery_pending = false;
                    info!("recovered records flushed, recovery file removed");
                }
                Err(err) => warn!(error = %err, "failed to remove recovery file"),
            }
        }

        let mut backup = None;
        if !batch.is_empty() {
            state.saves_since_backup += 1;
            if state.saves_since_backup >= self.config.backup_interval_saves {
                backup = self.backup_locked(state).await.ok().map(|entry| entry.id);
            }
        }

        debug!(flushed = batch.len(), total, "flush complete");
        Ok(FlushOutcome {
            flushed: batch.len(),
            total,
            pending_saved,
            backup,
        })
    }

    async fn flush_failed(&self, state: &mut FlushState, err: LedgerError) -> LedgerError {
        state.consecutive_failures += 1;
        let consecutive = state.consecutive_failures;
        warn!(consecutive, error = %err, "flush failed, batch kept in buffer");

        let threshold = self.config.alert_after_failures.max(1);
        if consecutive % threshold == 0 {
            self.alert(
                AlertKind::FlushFailing,
                format!("{} consecutive flush failures, last: {}", consecutive, err),
            )
            .await;
        }

        match err {
            LedgerError::LockTimeout { .. } => err,
            other => LedgerError::FlushFailure {
                consecutive,
                reason: other.to_string(),
            },
        }
    }

    /// Replace the in-memory snapshot with records that are already on disk.
    /// The disk is authoritative at this point, so a poisoned lock is taken
    /// over rather than reported.
    pub(super) fn commit(&self, records: Vector<ResponseRecord>) {
        *self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = records;
    }

    /// Persist the id high-water mark ahead of any ledger write that puts new
    /// ids on disk.
    pub(super) async fn save_sequence(&self, state: &mut FlushState) -> Result<()> {
        let next_record_id = self.buffer.next_record_id()?;
        if next_record_id <= state.sequence_saved {
            return Ok(());
        }
        let sequence = RecordSequence { next_record_id };
        self.blocking(move |store| write_json(store, Dataset::Sequence, &sequence))
            .await?;
        state.sequence_saved = next_record_id;
        Ok(())
    }

    pub(super) async fn write_ledger(&self, records: Vector<ResponseRecord>) -> Result<()> {
        self.blocking(move |store| write_json(store, Dataset::Ledger, &records))
            .await
    }

    async fn write_pending(&self, messages: Vec<TriggeringMessage>) -> Result<()> {
        self.blocking(move |store| write_json(store, Dataset::PendingCache, &messages))
            .await
    }

    /// Take a backup and prune old ones. Resets the save counter only on
    /// success, so a failed backup is retried after the next flush.
    pub(super) async fn backup_locked(&self, state: &mut FlushState) -> Result<BackupEntry> {
        match self.rotator.create_backup().await {
            Ok(entry) => {
                state.saves_since_backup = 0;
                if let Err(err) = self.rotator.prune_async().await {
                    warn!(error = %err, "backup pruning failed");
                }
                Ok(entry)
            }
            Err(err) => {
                warn!(error = %err, "backup failed");
                self.alert(AlertKind::BackupFailed, err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Flush, then take a backup regardless of the save counter.
    pub async fn backup_now(&self) -> Result<BackupEntry> {
        let mut state = self.flush_state.lock().await;
        let outcome = self.flush_locked(&mut state).await?;
        if let Some(id) = outcome.backup {
            if let Some(entry) = self
                .rotator
                .list_backups_async()
                .await?
                .into_iter()
                .find(|entry| entry.id == id)
            {
                return Ok(entry);
            }
        }
        self.backup_locked(&mut state).await
    }

    /// Final flush. If it fails, the buffer is written to the recovery
    /// dataset so the next start can pick it up.
    pub async fn shutdown(&self) -> Result<ShutdownOutcome> {
        let mut state = self.flush_state.lock().await;
        let flush_err = match self.flush_locked(&mut state).await {
            Ok(outcome) => {
                info!(flushed = outcome.flushed, total = outcome.total, "final flush complete");
                return Ok(ShutdownOutcome::Flushed(outcome));
            }
            Err(err) => err,
        };

        let records = self.buffer.snapshot()?;
        if records.is_empty() {
            return Err(flush_err);
        }
        let count = records.len();
        let location = self.store.location(Dataset::Recovery);
        if let Err(err) = self
            .blocking(move |store| write_json(store, Dataset::Recovery, &records))
            .await
        {
            error!(error = %err, records = count, "failed to write recovery file");
            return Err(err);
        }

        self.alert(
            AlertKind::RecoveryWritten,
            format!(
                "final flush failed ({}); {} records saved to {}",
                flush_err, count, location
            ),
        )
        .await;
        Ok(ShutdownOutcome::RecoveryWritten { records: count })
    }
}
