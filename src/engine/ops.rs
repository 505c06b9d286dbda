use super::recovery::{is_valid, quarantine_stamp};
use super::{FlushState, LedgerEngine};
use crate::backup::{BackupEntry, PruneReport};
use crate::core::{Dataset, LedgerError, RecordId, Result, UserId};
use crate::ledger::{
    all_user_stats, overall_stats, user_stats, OverallStats, PendingCache, ReplyEvent,
    ResponseRecord, TriggeringMessage, UserStats,
};
use crate::roster::{Roster, RosterChange};
use crate::storage::read_json;
use chrono::{DateTime, Utc};
use im::Vector;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub backup_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_pending: usize,
    /// `None` when pruning failed; the failure is logged
    pub prune: Option<PruneReport>,
}

impl LedgerEngine {
    /// Remember a message a tracked user may reply to later.
    pub fn observe_message(&self, message: TriggeringMessage) -> Result<()> {
        self.pending.lock()?.remember(message);
        Ok(())
    }

    /// Turn a reply event into a buffered record.
    ///
    /// Returns `None` when the replying user is not tracked or the message
    /// being replied to is unknown. Never touches disk.
    pub fn record_reply(&self, event: &ReplyEvent) -> Result<Option<ResponseRecord>> {
        if !self.roster.is_tracked(event.tracked_user_id)? {
            return Ok(None);
        }

        let triggering = {
            let mut pending = self.pending.lock()?;
            match &event.triggering {
                Some(inline) => {
                    pending.resolve(inline.chat_id, inline.message_id);
                    Some(inline.clone())
                }
                None => event
                    .reply
                    .reply_to_message_id
                    .and_then(|message_id| pending.resolve(event.chat_id, message_id)),
            }
        };
        let Some(triggering) = triggering else {
            debug!(
                user_id = event.tracked_user_id,
                chat_id = event.chat_id,
                "reply to unknown message ignored"
            );
            return Ok(None);
        };

        let max_chars = self.config.snippet_max_chars;
        let record = self
            .buffer
            .append_with(|record_id| ResponseRecord::build(record_id, event, &triggering, max_chars))?;
        debug!(
            record_id = record.record_id,
            user_id = record.target_user_id,
            latency = record.latency_seconds,
            "reply recorded"
        );
        Ok(Some(record))
    }

    pub fn stats_for(&self, user_id: UserId) -> Result<UserStats> {
        self.stats_for_as_of(user_id, self.clock.now())
    }

    /// Stats for one user with "today" taken as the local day of `as_of`.
    pub fn stats_for_as_of(&self, user_id: UserId, as_of: DateTime<Utc>) -> Result<UserStats> {
        let records = self.records()?;
        Ok(user_stats(user_id, &records, self.calendar.as_ref(), as_of))
    }

    /// Stats for every tracked user, busiest first.
    pub fn stats_for_all(&self) -> Result<Vec<UserStats>> {
        self.stats_for_all_as_of(self.clock.now())
    }

    pub fn stats_for_all_as_of(&self, as_of: DateTime<Utc>) -> Result<Vec<UserStats>> {
        let records = self.records()?;
        let tracked = self.roster.tracked()?;
        Ok(all_user_stats(
            &tracked,
            &records,
            self.calendar.as_ref(),
            as_of,
        ))
    }

    pub fn overall_stats(&self) -> Result<OverallStats> {
        self.overall_stats_as_of(self.clock.now())
    }

    pub fn overall_stats_as_of(&self, as_of: DateTime<Utc>) -> Result<OverallStats> {
        let records = self.records()?;
        Ok(overall_stats(&records, self.calendar.as_ref(), as_of))
    }

    /// Drop every record whose reply happened before `cutoff`. Records at
    /// exactly `cutoff` are kept. Buffered records are included.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.flush_state.lock().await;
        let removed = self
            .rewrite_locked(&mut state, move |record| record.reply_timestamp >= cutoff)
            .await?;
        info!(removed, cutoff = %cutoff, "purged old records");
        Ok(removed)
    }

    /// Flush, back up, then purge. Nothing is purged if the flush or the
    /// backup fails.
    pub async fn purge_with_backup(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        let mut state = self.flush_state.lock().await;
        self.flush_locked(&mut state).await?;
        let backup = self.backup_locked(&mut state).await?;
        let removed = self
            .rewrite_locked(&mut state, move |record| record.reply_timestamp >= cutoff)
            .await?;
        info!(removed, backup = %backup.id, cutoff = %cutoff, "purged old records");
        Ok(PurgeReport {
            removed,
            backup_id: backup.id,
        })
    }

    /// Delete records by id, flushed or buffered. Unknown ids are ignored.
    pub async fn delete_records(&self, ids: &[RecordId]) -> Result<usize> {
        let ids = ids.iter().copied().collect::<HashSet<_>>();
        let mut state = self.flush_state.lock().await;
        let removed = self
            .rewrite_locked(&mut state, move |record| !ids.contains(&record.record_id))
            .await?;
        info!(removed, "deleted records");
        Ok(removed)
    }

    /// Rewrite the ledger keeping only records that pass `keep`. The buffer
    /// is folded in first so the result stays a single consistent file.
    async fn rewrite_locked<F>(&self, state: &mut FlushState, keep: F) -> Result<usize>
    where
        F: Fn(&ResponseRecord) -> bool + Send + Sync,
    {
        let current = self.committed.read()?.clone();
        let batch = self.buffer.take_all()?;
        let before = current.len() + batch.len();
        let next = current
            .into_iter()
            .chain(batch.iter().cloned())
            .filter(|record| keep(record))
            .collect::<Vector<_>>();
        let removed = before - next.len();
        if removed == 0 {
            self.buffer.restore_front(batch)?;
            return Ok(0);
        }

        let written = if batch.is_empty() {
            self.write_ledger(next.clone()).await
        } else {
            match self.save_sequence(state).await {
                Ok(()) => self.write_ledger(next.clone()).await,
                Err(err) => Err(err),
            }
        };
        match written {
            Ok(()) => {
                self.commit(next);
                state.consecutive_failures = 0;
                Ok(removed)
            }
            Err(err) => {
                self.buffer.restore_front(batch)?;
                Err(err)
            }
        }
    }

    /// Periodic housekeeping: expire old pending messages and prune backups.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let cutoff = self.clock.now() - self.config.pending_ttl();
        let expired_pending = self.pending.lock()?.expire_before(cutoff);
        if expired_pending > 0 {
            info!(expired_pending, "expired unanswered messages");
        }

        let _state = self.flush_state.lock().await;
        let prune = match self.rotator.prune_async().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "backup pruning failed");
                None
            }
        };
        Ok(CleanupReport {
            expired_pending,
            prune,
        })
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        self.rotator.list_backups_async().await
    }

    /// Replace `dataset` with its newest valid backup copy. The current file
    /// is preserved beside it and the in-memory state is reloaded.
    pub async fn restore_from_backup(&self, dataset: Dataset) -> Result<Option<BackupEntry>> {
        if !Dataset::BACKED_UP.contains(&dataset) {
            return Err(LedgerError::NotFound(format!(
                "dataset '{}' is never backed up",
                dataset
            )));
        }
        let _state = self.flush_state.lock().await;
        let rotator = self.rotator.clone();
        let stamp = quarantine_stamp(self.clock.as_ref());
        let restored = self
            .blocking(move |store| {
                let Some((entry, bytes)) =
                    rotator.find_latest(dataset, |bytes| is_valid(dataset, bytes))?
                else {
                    return Ok(None);
                };
                if let Some(preserved) = store.quarantine(dataset, &stamp)? {
                    info!(preserved = %preserved.display(), "previous copy preserved");
                }
                store.write(dataset, &bytes)?;
                Ok(Some(entry))
            })
            .await?;
        let Some(entry) = restored else {
            return Ok(None);
        };

        match dataset {
            Dataset::Ledger => {
                let records = self
                    .blocking(|store| read_json::<Vec<ResponseRecord>>(store, Dataset::Ledger))
                    .await?
                    .unwrap_or_default();
                self.commit(records.into_iter().collect());
            }
            Dataset::PendingCache => {
                let messages = self
                    .blocking(|store| {
                        read_json::<Vec<TriggeringMessage>>(store, Dataset::PendingCache)
                    })
                    .await?
                    .unwrap_or_default();
                *self.pending.lock()? = PendingCache::from_messages(messages);
            }
            Dataset::TrackedUsers | Dataset::Admins => {
                let roster = self.roster.clone();
                tokio::task::spawn_blocking(move || roster.reload()).await??;
            }
            Dataset::Recovery | Dataset::Sequence => {}
        }
        info!(dataset = %dataset, backup = %entry.id, "restored from backup");
        Ok(Some(entry))
    }

    pub async fn add_tracked_user(&self, user_id: UserId) -> Result<RosterChange> {
        self.change_roster(move |roster| roster.add_tracked(user_id))
            .await
    }

    pub async fn remove_tracked_user(&self, user_id: UserId) -> Result<RosterChange> {
        self.change_roster(move |roster| roster.remove_tracked(user_id))
            .await
    }

    pub async fn add_admin(&self, user_id: UserId) -> Result<RosterChange> {
        self.change_roster(move |roster| roster.add_admin(user_id))
            .await
    }

    pub async fn remove_admin(&self, user_id: UserId) -> Result<RosterChange> {
        self.change_roster(move |roster| roster.remove_admin(user_id))
            .await
    }

    /// Flush before touching the user lists so buffered records are on disk
    /// if the change goes wrong. A failed flush does not block the change.
    async fn change_roster<F>(&self, change: F) -> Result<RosterChange>
    where
        F: FnOnce(&Roster) -> Result<RosterChange> + Send + 'static,
    {
        if let Err(err) = self.flush().await {
            warn!(error = %err, "flush before roster change failed");
        }
        let roster: Arc<Roster> = self.roster.clone();
        tokio::task::spawn_blocking(move || change(&roster)).await?
    }
}
