use super::RecordSequence;
use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::backup::BackupRotator;
use crate::clock::Clock;
use crate::core::{Dataset, LedgerError, Result};
use crate::ledger::{PendingCache, ResponseRecord, TriggeringMessage};
use crate::roster::{Roster, UserListFile};
use crate::storage::{read_json, DatasetStore};
use im::Vector;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub(super) struct LoadedState {
    pub committed: Vector<ResponseRecord>,
    pub pending: PendingCache,
    pub roster: Roster,
    /// Records from a recovery file that are not already in the ledger
    pub recovered: Vec<ResponseRecord>,
    pub recovery_pending: bool,
    pub sequence: RecordSequence,
}

/// Whether `bytes` parse as the content of `dataset`.
pub(super) fn is_valid(dataset: Dataset, bytes: &[u8]) -> bool {
    match dataset {
        Dataset::Ledger | Dataset::Recovery => {
            serde_json::from_slice::<Vec<ResponseRecord>>(bytes).is_ok()
        }
        Dataset::PendingCache => serde_json::from_slice::<Vec<TriggeringMessage>>(bytes).is_ok(),
        Dataset::TrackedUsers | Dataset::Admins => {
            serde_json::from_slice::<UserListFile>(bytes).is_ok()
        }
        Dataset::Sequence => serde_json::from_slice::<RecordSequence>(bytes).is_ok(),
    }
}

pub(super) fn quarantine_stamp(clock: &dyn Clock) -> String {
    clock.now().format("%Y%m%dT%H%M%S").to_string()
}

pub(super) async fn load_state(
    store: &Arc<dyn DatasetStore>,
    rotator: &BackupRotator,
    clock: &dyn Clock,
    alerts: &dyn AlertSink,
) -> Result<LoadedState> {
    let committed: Vector<ResponseRecord> =
        load_or_restore::<Vec<ResponseRecord>>(store, rotator, clock, alerts, Dataset::Ledger)
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect();
    let pending = load_or_restore::<Vec<TriggeringMessage>>(
        store,
        rotator,
        clock,
        alerts,
        Dataset::PendingCache,
    )
    .await?
    .map(PendingCache::from_messages)
    .unwrap_or_default();
    let tracked =
        load_or_restore::<UserListFile>(store, rotator, clock, alerts, Dataset::TrackedUsers).await?;
    let admins =
        load_or_restore::<UserListFile>(store, rotator, clock, alerts, Dataset::Admins).await?;
    let roster = Roster::from_files(store.clone(), tracked, admins);

    let (recovered, recovery_pending) = load_recovery(store, &committed, clock, alerts).await?;
    let sequence = load_sequence(store, clock, alerts).await?;

    Ok(LoadedState {
        committed,
        pending,
        roster,
        recovered,
        recovery_pending,
        sequence,
    })
}

/// Read a dataset. If it is corrupt, preserve the bad file, put the newest
/// valid backup copy in its place and alert. Fails with the original
/// corruption error when no backup has a usable copy.
async fn load_or_restore<T>(
    store: &Arc<dyn DatasetStore>,
    rotator: &BackupRotator,
    clock: &dyn Clock,
    alerts: &dyn AlertSink,
    dataset: Dataset,
) -> Result<Option<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let first = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || read_json::<T>(store.as_ref(), dataset)).await?
    };
    let corrupt = match first {
        Ok(value) => return Ok(value),
        Err(err) if err.is_corruption() => err,
        Err(err) => return Err(err),
    };
    warn!(dataset = %dataset, error = %corrupt, "dataset is corrupt, looking for a backup");

    let stamp = quarantine_stamp(clock);
    let store_for_restore = store.clone();
    let rotator = rotator.clone();
    let restored = tokio::task::spawn_blocking(move || -> Result<Option<(String, T)>> {
        let Some((entry, bytes)) =
            rotator.find_latest(dataset, |bytes| serde_json::from_slice::<T>(bytes).is_ok())?
        else {
            return Ok(None);
        };
        let value = serde_json::from_slice::<T>(&bytes)
            .map_err(|err| LedgerError::Serialization(err.to_string()))?;
        store_for_restore.quarantine(dataset, &stamp)?;
        store_for_restore.write(dataset, &bytes)?;
        Ok(Some((entry.id, value)))
    })
    .await??;

    match restored {
        Some((backup_id, value)) => {
            let message = format!(
                "{}; restored from backup '{}', corrupt copy preserved beside it",
                corrupt, backup_id
            );
            alerts
                .alert(Alert::new(AlertKind::CorruptData, message, clock.now()))
                .await;
            Ok(Some(value))
        }
        None => {
            alerts
                .alert(Alert::new(
                    AlertKind::CorruptData,
                    format!("{}; no valid backup available", corrupt),
                    clock.now(),
                ))
                .await;
            Err(corrupt)
        }
    }
}

/// Pick up records a previous shutdown could not flush. Records whose id is
/// already in the ledger are skipped.
async fn load_recovery(
    store: &Arc<dyn DatasetStore>,
    committed: &Vector<ResponseRecord>,
    clock: &dyn Clock,
    alerts: &dyn AlertSink,
) -> Result<(Vec<ResponseRecord>, bool)> {
    let read = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || {
            read_json::<Vec<ResponseRecord>>(store.as_ref(), Dataset::Recovery)
        })
        .await?
    };
    let records = match read {
        Ok(Some(records)) => records,
        Ok(None) => return Ok((Vec::new(), false)),
        Err(err) if err.is_corruption() => {
            let stamp = quarantine_stamp(clock);
            let store = store.clone();
            let preserved = tokio::task::spawn_blocking(move || {
                store.quarantine(Dataset::Recovery, &stamp)
            })
            .await??;
            alerts
                .alert(Alert::new(
                    AlertKind::CorruptData,
                    format!(
                        "{}; recovery file set aside at {:?}",
                        err,
                        preserved.map(|path| path.display().to_string())
                    ),
                    clock.now(),
                ))
                .await;
            return Ok((Vec::new(), false));
        }
        Err(err) => return Err(err),
    };

    let mut seen = committed
        .iter()
        .map(|record| record.record_id)
        .collect::<HashSet<_>>();
    let total = records.len();
    let fresh = records
        .into_iter()
        .filter(|record| seen.insert(record.record_id))
        .collect::<Vec<_>>();

    if fresh.is_empty() {
        let store = store.clone();
        let removed =
            tokio::task::spawn_blocking(move || store.remove(Dataset::Recovery)).await?;
        if let Err(err) = removed {
            warn!(error = %err, "failed to remove already-ingested recovery file");
        }
        info!(total, "recovery file already ingested, removed");
        return Ok((Vec::new(), false));
    }

    info!(total, fresh = fresh.len(), "re-ingesting recovery file");
    Ok((fresh, true))
}

/// Read the id high-water mark. A corrupt mark is set aside and ids fall back
/// to the records on disk.
async fn load_sequence(
    store: &Arc<dyn DatasetStore>,
    clock: &dyn Clock,
    alerts: &dyn AlertSink,
) -> Result<RecordSequence> {
    let read = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || {
            read_json::<RecordSequence>(store.as_ref(), Dataset::Sequence)
        })
        .await?
    };
    match read {
        Ok(sequence) => Ok(sequence.unwrap_or_default()),
        Err(err) if err.is_corruption() => {
            let stamp = quarantine_stamp(clock);
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.quarantine(Dataset::Sequence, &stamp))
                .await??;
            alerts
                .alert(Alert::new(
                    AlertKind::CorruptData,
                    format!("{}; record ids continue from the ledger", err),
                    clock.now(),
                ))
                .await;
            Ok(RecordSequence::default())
        }
        Err(err) => Err(err),
    }
}
