//! File-per-dataset store with write-temp-then-rename semantics.

use super::engine::DatasetStore;
use super::lock::{DatasetLock, FileLock, LockGuard};
use crate::core::{Dataset, LedgerError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

pub struct AtomicFileStore {
    dir: PathBuf,
    lock: Arc<dyn DatasetLock>,
    lock_timeout: Duration,
}

/// A fully written and synced temp file that has not replaced the target yet.
///
/// Dropping it without calling [`StagedWrite::commit`] deletes the temp file
/// and releases the lock, leaving the target untouched.
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
    _guard: LockGuard,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Atomically rename the temp file over the target.
    pub fn commit(self) -> Result<()> {
        let StagedWrite { tmp, target, _guard } = self;
        tmp.persist(&target).map_err(|err| {
            LedgerError::Io(format!(
                "Failed to rename temp file -> '{}': {}",
                target.display(),
                err.error
            ))
        })?;
        if let Some(parent) = target.parent() {
            sync_dir(parent);
        }
        Ok(())
    }
}

impl AtomicFileStore {
    /// Open a store rooted at `dir`, guarded by sidecar lock files in the
    /// same directory.
    pub fn open(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let dir = dir.into();
        let lock = Arc::new(FileLock::new(dir.clone()));
        Self::with_lock(dir, lock, lock_timeout)
    }

    pub fn with_lock(
        dir: impl Into<PathBuf>,
        lock: Arc<dyn DatasetLock>,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            LedgerError::Io(format!(
                "Failed to create data directory '{}': {}",
                dir.display(),
                err
            ))
        })?;
        Ok(Self {
            dir,
            lock,
            lock_timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, dataset: Dataset) -> PathBuf {
        self.dir.join(dataset.file_name())
    }

    fn acquire(&self, dataset: Dataset) -> Result<LockGuard> {
        self.lock.acquire(dataset.name(), self.lock_timeout)
    }

    /// Write `bytes` to a synced temp file next to the dataset, holding the
    /// dataset lock until the returned write is committed or dropped.
    pub fn stage(&self, dataset: Dataset, bytes: &[u8]) -> Result<StagedWrite> {
        let guard = self.acquire(dataset)?;
        let target = self.path_of(dataset);

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", dataset.file_name()))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|err| {
                LedgerError::Io(format!(
                    "Failed to create temp file in '{}': {}",
                    self.dir.display(),
                    err
                ))
            })?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(bytes)
            .and_then(|_| tmp.flush())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| {
                LedgerError::Io(format!(
                    "Failed to write temp file '{}': {}",
                    tmp_path.display(),
                    err
                ))
            })?;

        Ok(StagedWrite {
            tmp,
            target,
            _guard: guard,
        })
    }

    /// Remove temp files left behind by a process that died between staging
    /// and commit. Returns how many were removed.
    pub fn sweep_stale_temps(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_stale = name.starts_with('.')
                && name.ends_with(TEMP_SUFFIX)
                && Dataset::ALL
                    .iter()
                    .any(|dataset| name.starts_with(&format!(".{}.", dataset.file_name())));
            if !is_stale {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(file = name, error = %err, "failed to remove stale temp file"),
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept stale temp files");
        }
        Ok(removed)
    }
}

impl DatasetStore for AtomicFileStore {
    fn read(&self, dataset: Dataset) -> Result<Option<Vec<u8>>> {
        let _guard = self.acquire(dataset)?;
        let path = self.path_of(dataset);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LedgerError::Io(format!(
                "Failed to read '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    fn write(&self, dataset: Dataset, bytes: &[u8]) -> Result<()> {
        self.stage(dataset, bytes)?.commit()
    }

    fn remove(&self, dataset: Dataset) -> Result<bool> {
        let _guard = self.acquire(dataset)?;
        let path = self.path_of(dataset);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(LedgerError::Io(format!(
                "Failed to remove '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    fn copy_to(&self, dataset: Dataset, dest: &Path) -> Result<bool> {
        let _guard = self.acquire(dataset)?;
        let src = self.path_of(dataset);
        if !src.exists() {
            return Ok(false);
        }
        fs::copy(&src, dest).map_err(|err| {
            LedgerError::Io(format!(
                "Failed to copy '{}' -> '{}': {}",
                src.display(),
                dest.display(),
                err
            ))
        })?;
        Ok(true)
    }

    fn quarantine(&self, dataset: Dataset, stamp: &str) -> Result<Option<PathBuf>> {
        let _guard = self.acquire(dataset)?;
        let src = self.path_of(dataset);
        if !src.exists() {
            return Ok(None);
        }
        let dest = self
            .dir
            .join(format!("{}.corrupt-{}", dataset.file_name(), stamp));
        fs::rename(&src, &dest).map_err(|err| {
            LedgerError::Io(format!(
                "Failed to preserve '{}' as '{}': {}",
                src.display(),
                dest.display(),
                err
            ))
        })?;
        Ok(Some(dest))
    }

    fn location(&self, dataset: Dataset) -> String {
        self.path_of(dataset).display().to_string()
    }

    fn copy_artifact(&self, src: &Path, dest: &Path) -> Result<bool> {
        let name = src
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        let _guard = self.lock.acquire(name, self.lock_timeout)?;
        if !src.exists() {
            return Ok(false);
        }
        fs::copy(src, dest).map_err(|err| {
            LedgerError::Io(format!(
                "Failed to copy '{}' -> '{}': {}",
                src.display(),
                dest.display(),
                err
            ))
        })?;
        Ok(true)
    }
}

/// Persist the rename itself; failures only weaken durability, so they are
/// logged rather than returned.
fn sync_dir(dir: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!(dir = %dir.display(), error = %err, "failed to sync directory after rename");
    }
}
