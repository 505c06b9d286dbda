//! Timestamped backups of every persisted dataset.
//!
//! A backup is a directory named by its id holding a copy of each dataset
//! file, any configured report artifacts and a `manifest.json`. It is built
//! under `<id>.partial` and renamed into place only once complete, so a
//! listed backup is never half-written.

pub mod retention;

pub use retention::{RetentionPlan, RetentionPolicy};

use crate::clock::Clock;
use crate::core::{Dataset, LedgerError, Result};
use crate::storage::DatasetStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// File names copied into the backup directory
    pub files: Vec<String>,
    #[serde(skip)]
    pub dir: PathBuf,
}

impl BackupEntry {
    pub fn contains(&self, dataset: Dataset) -> bool {
        let name = dataset.file_name();
        self.files.iter().any(|file| *file == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    /// Backups that should have been deleted but could not be
    pub failed: Vec<String>,
    pub partials_removed: usize,
}

/// Creates, lists, prunes and restores from backups.
///
/// Cheap to clone; clones share the store and clock.
#[derive(Clone)]
pub struct BackupRotator {
    dir: PathBuf,
    store: Arc<dyn DatasetStore>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
    copy_timeout: Duration,
    artifacts: Vec<PathBuf>,
}

impl BackupRotator {
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<dyn DatasetStore>,
        clock: Arc<dyn Clock>,
        policy: RetentionPolicy,
        copy_timeout: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            store,
            clock,
            policy,
            copy_timeout,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Copy every dataset into a new backup, bounded by the copy timeout.
    ///
    /// A copy that times out is abandoned: its partial directory is removed
    /// and never renamed into place.
    pub async fn create_backup(&self) -> Result<BackupEntry> {
        let abandoned = Arc::new(AtomicBool::new(false));
        let rotator = self.clone();
        let flag = abandoned.clone();
        let task = tokio::task::spawn_blocking(move || rotator.create_backup_blocking(&flag));

        match timeout(self.copy_timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                Err(LedgerError::BackupFailure(format!(
                    "backup copy exceeded {} ms",
                    self.copy_timeout.as_millis()
                )))
            }
        }
    }

    fn create_backup_blocking(&self, abandoned: &AtomicBool) -> Result<BackupEntry> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            LedgerError::BackupFailure(format!(
                "create backup dir '{}': {}",
                self.dir.display(),
                err
            ))
        })?;

        let created_at = self.clock.now();
        let id = self.unique_id(created_at);
        let partial = self.dir.join(format!("{}{}", id, PARTIAL_SUFFIX));
        let result = self.fill_partial(&partial, &id, created_at, abandoned);

        match result {
            Ok(files) => {
                let dir = self.dir.join(&id);
                fs::rename(&partial, &dir).map_err(|err| {
                    remove_dir_quietly(&partial);
                    LedgerError::BackupFailure(format!("finalize backup '{}': {}", id, err))
                })?;
                info!(backup = %id, files = files.len(), "backup created");
                Ok(BackupEntry {
                    id,
                    created_at,
                    files,
                    dir,
                })
            }
            Err(err) => {
                remove_dir_quietly(&partial);
                Err(match err {
                    LedgerError::BackupFailure(_) => err,
                    other => LedgerError::BackupFailure(other.to_string()),
                })
            }
        }
    }

    fn fill_partial(
        &self,
        partial: &Path,
        id: &str,
        created_at: DateTime<Utc>,
        abandoned: &AtomicBool,
    ) -> Result<Vec<String>> {
        fs::create_dir_all(partial)?;

        let mut files = Vec::new();
        for dataset in Dataset::BACKED_UP {
            let name = dataset.file_name();
            if self.store.copy_to(dataset, &partial.join(&name))? {
                files.push(name);
            }
        }
        for artifact in &self.artifacts {
            let Some(name) = artifact.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if self.store.copy_artifact(artifact, &partial.join(name))? {
                files.push(name.to_string());
            } else {
                debug!(artifact = %artifact.display(), "report artifact missing, skipped");
            }
        }

        let manifest = BackupEntry {
            id: id.to_string(),
            created_at,
            files: files.clone(),
            dir: PathBuf::new(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| LedgerError::Serialization(err.to_string()))?;
        fs::write(partial.join(MANIFEST_FILE), bytes)?;

        if abandoned.load(Ordering::SeqCst) {
            return Err(LedgerError::BackupFailure(format!(
                "backup '{}' abandoned after timeout",
                id
            )));
        }
        Ok(files)
    }

    fn unique_id(&self, created_at: DateTime<Utc>) -> String {
        let base = created_at.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let taken = |id: &str| {
            self.dir.join(id).exists()
                || self.dir.join(format!("{}{}", id, PARTIAL_SUFFIX)).exists()
        };
        if !taken(&base) {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Completed backups, newest first. Directories without a readable
    /// manifest are skipped with a warning.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            let path = item.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !path.is_dir() || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            match read_manifest(&path) {
                Ok(mut entry) => {
                    entry.dir = path.clone();
                    entries.push(entry);
                }
                Err(err) => warn!(dir = %path.display(), error = %err, "skipping backup without valid manifest"),
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(entries)
    }

    /// Apply the retention policy. Failing to delete one backup is logged
    /// and does not stop the rest.
    pub fn prune(&self) -> Result<PruneReport> {
        self.prune_with(|dir| fs::remove_dir_all(dir))
    }

    fn prune_with(&self, remove: impl Fn(&Path) -> std::io::Result<()>) -> Result<PruneReport> {
        let mut report = PruneReport {
            partials_removed: self.remove_partials()?,
            ..PruneReport::default()
        };

        let entries = self.list_backups()?;
        let plan = self.policy.plan(
            entries.iter().map(|entry| (entry.id.as_str(), entry.created_at)),
            self.clock.now(),
        );
        report.kept = plan.keep.len();

        for id in plan.delete {
            let Some(entry) = entries.iter().find(|entry| entry.id == id) else {
                continue;
            };
            match remove(&entry.dir) {
                Ok(()) => {
                    debug!(backup = %id, "pruned backup");
                    report.deleted.push(id);
                }
                Err(err) => {
                    warn!(backup = %id, error = %err, "failed to prune backup");
                    report.failed.push(id);
                }
            }
        }
        if !report.deleted.is_empty() {
            info!(
                deleted = report.deleted.len(),
                kept = report.kept,
                "pruned old backups"
            );
        }
        Ok(report)
    }

    pub async fn prune_async(&self) -> Result<PruneReport> {
        let rotator = self.clone();
        tokio::task::spawn_blocking(move || rotator.prune()).await?
    }

    pub async fn list_backups_async(&self) -> Result<Vec<BackupEntry>> {
        let rotator = self.clone();
        tokio::task::spawn_blocking(move || rotator.list_backups()).await?
    }

    /// Partial directories are only ever leftovers of an interrupted or
    /// abandoned backup.
    fn remove_partials(&self) -> Result<usize> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut removed = 0;
        for item in read_dir {
            let path = item?.path();
            let is_partial = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
            if is_partial && path.is_dir() {
                match fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(dir = %path.display(), error = %err, "failed to remove partial backup"),
                }
            }
        }
        Ok(removed)
    }

    /// Newest backup copy of `dataset` that `accept` approves, with its bytes.
    pub fn find_latest(
        &self,
        dataset: Dataset,
        accept: impl Fn(&[u8]) -> bool,
    ) -> Result<Option<(BackupEntry, Vec<u8>)>> {
        for entry in self.list_backups()? {
            if !entry.contains(dataset) {
                continue;
            }
            let path = entry.dir.join(dataset.file_name());
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(backup = %entry.id, error = %err, "unreadable backup copy");
                    continue;
                }
            };
            if !accept(&bytes) {
                warn!(backup = %entry.id, dataset = %dataset, "backup copy rejected, trying older");
                continue;
            }
            return Ok(Some((entry, bytes)));
        }
        Ok(None)
    }

    /// Overwrite `dataset` with the newest backup copy that `accept` approves.
    /// Returns the backup used, or `None` if no backup had a usable copy.
    pub fn restore_latest(
        &self,
        dataset: Dataset,
        accept: impl Fn(&[u8]) -> bool,
    ) -> Result<Option<BackupEntry>> {
        let Some((entry, bytes)) = self.find_latest(dataset, accept)? else {
            return Ok(None);
        };
        self.store.write(dataset, &bytes).map_err(|err| {
            LedgerError::BackupFailure(format!(
                "restore '{}' from backup '{}': {}",
                dataset, entry.id, err
            ))
        })?;
        info!(backup = %entry.id, dataset = %dataset, "dataset restored from backup");
        Ok(Some(entry))
    }
}

fn read_manifest(dir: &Path) -> Result<BackupEntry> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    serde_json::from_slice(&bytes).map_err(|err| LedgerError::Serialization(err.to_string()))
}

fn remove_dir_quietly(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %err, "failed to remove partial backup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup(min_keep: usize) -> (TempDir, Arc<InMemoryStore>, ManualClock, BackupRotator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let rotator = BackupRotator::new(
            dir.path().join("backups"),
            store.clone(),
            Arc::new(clock.clone()),
            RetentionPolicy::new(30, min_keep),
            Duration::from_secs(5),
        );
        (dir, store, clock, rotator)
    }

    #[tokio::test]
    async fn test_create_backup_copies_datasets_and_manifest() {
        let (_dir, store, _clock, rotator) = setup(5);
        store.write(Dataset::Ledger, b"[]").unwrap();
        store.write(Dataset::Admins, b"[1]").unwrap();

        let entry = rotator.create_backup().await.unwrap();
        assert_eq!(entry.id, "20240101T000000.000Z");
        assert!(entry.contains(Dataset::Ledger));
        assert!(!entry.contains(Dataset::PendingCache));
        assert_eq!(fs::read(entry.dir.join("response_data.json")).unwrap(), b"[]");
        assert!(entry.dir.join(MANIFEST_FILE).exists());

        let listed = rotator.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].files, entry.files);
    }

    #[tokio::test]
    async fn test_same_instant_backups_get_distinct_ids() {
        let (_dir, store, _clock, rotator) = setup(5);
        store.write(Dataset::Ledger, b"[]").unwrap();

        let first = rotator.create_backup().await.unwrap();
        let second = rotator.create_backup().await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(rotator.list_backups().unwrap()[0].id, second.id);
    }

    #[tokio::test]
    async fn test_prune_applies_retention_and_clears_partials() {
        let (_dir, store, clock, rotator) = setup(2);
        store.write(Dataset::Ledger, b"[]").unwrap();
        for _ in 0..4 {
            rotator.create_backup().await.unwrap();
            clock.advance(chrono::Duration::days(1));
        }
        fs::create_dir_all(rotator.dir().join("stale.partial")).unwrap();
        clock.advance(chrono::Duration::days(60));

        let report = rotator.prune().unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.partials_removed, 1);

        let remaining = rotator
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|entry| entry.id)
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec!["20240104T000000.000Z", "20240103T000000.000Z"]);
    }

    #[tokio::test]
    async fn test_list_skips_directories_without_manifest() {
        let (_dir, store, _clock, rotator) = setup(5);
        store.write(Dataset::Ledger, b"[]").unwrap();
        rotator.create_backup().await.unwrap();
        fs::create_dir_all(rotator.dir().join("junk")).unwrap();

        assert_eq!(rotator.list_backups().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_latest_skips_rejected_copies() {
        let (_dir, store, clock, rotator) = setup(5);
        store.write(Dataset::Ledger, b"[\"good\"]").unwrap();
        rotator.create_backup().await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        store.write(Dataset::Ledger, b"not json").unwrap();
        rotator.create_backup().await.unwrap();

        let restored = rotator
            .restore_latest(Dataset::Ledger, |bytes| {
                serde_json::from_slice::<serde_json::Value>(bytes).is_ok()
            })
            .unwrap()
            .unwrap();
        assert_eq!(restored.id, "20240101T000000.000Z");
        assert_eq!(
            store.read(Dataset::Ledger).unwrap().unwrap(),
            b"[\"good\"]".to_vec()
        );
    }

    #[tokio::test]
    async fn test_restore_latest_without_backups() {
        let (_dir, _store, _clock, rotator) = setup(5);
        assert!(rotator.restore_latest(Dataset::Ledger, |_| true).unwrap().is_none());
    }

    /// Store whose copies stall long enough to hit the copy timeout.
    struct StallingStore {
        inner: InMemoryStore,
        stall: std::time::Duration,
    }

    impl DatasetStore for StallingStore {
        fn read(&self, dataset: Dataset) -> Result<Option<Vec<u8>>> {
            self.inner.read(dataset)
        }

        fn write(&self, dataset: Dataset, bytes: &[u8]) -> Result<()> {
            self.inner.write(dataset, bytes)
        }

        fn remove(&self, dataset: Dataset) -> Result<bool> {
            self.inner.remove(dataset)
        }

        fn copy_to(&self, dataset: Dataset, dest: &Path) -> Result<bool> {
            std::thread::sleep(self.stall);
            self.inner.copy_to(dataset, dest)
        }

        fn quarantine(&self, dataset: Dataset, stamp: &str) -> Result<Option<PathBuf>> {
            self.inner.quarantine(dataset, stamp)
        }

        fn location(&self, dataset: Dataset) -> String {
            self.inner.location(dataset)
        }
    }

    #[tokio::test]
    async fn test_timed_out_backup_is_never_finalized() {
        let dir = TempDir::new().unwrap();
        let store = StallingStore {
            inner: InMemoryStore::new(),
            stall: Duration::from_millis(300),
        };
        store.write(Dataset::Ledger, b"[]").unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let rotator = BackupRotator::new(
            dir.path().join("backups"),
            Arc::new(store),
            Arc::new(clock),
            RetentionPolicy::new(30, 5),
            Duration::from_millis(20),
        );

        let err = rotator.create_backup().await.unwrap_err();
        assert!(matches!(err, LedgerError::BackupFailure(_)));
        assert!(rotator.list_backups().unwrap().is_empty());

        let report = rotator.prune().unwrap();
        assert_eq!(report.partials_removed, 1);

        // the stalled copy finishes later and must still not publish a backup
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(rotator.list_backups().unwrap().is_empty());
        let leftovers = fs::read_dir(rotator.dir())
            .unwrap()
            .filter_map(|item| item.ok())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_prune_failure_on_one_backup_does_not_stop_the_rest() {
        let (_dir, store, clock, rotator) = setup(0);
        store.write(Dataset::Ledger, b"[]").unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(rotator.create_backup().await.unwrap().id);
            clock.advance(chrono::Duration::days(1));
        }
        clock.advance(chrono::Duration::days(60));

        let stuck = ids[1].clone();
        let report = rotator
            .prune_with(|dir| {
                if dir.ends_with(&stuck) {
                    Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy"))
                } else {
                    fs::remove_dir_all(dir)
                }
            })
            .unwrap();

        assert_eq!(report.failed, vec![stuck.clone()]);
        assert_eq!(report.deleted.len(), 2);
        let remaining = rotator
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|entry| entry.id)
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec![stuck]);
    }
}
