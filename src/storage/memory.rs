use super::engine::DatasetStore;
use super::lock::{DatasetLock, ProcessLock};
use crate::core::{Dataset, LedgerError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Store that keeps every dataset in memory.
///
/// Stands in for the file store wherever durability across restarts is not
/// needed; backups taken from it still land on disk.
pub struct InMemoryStore {
    datasets: Mutex<HashMap<Dataset, Vec<u8>>>,
    quarantined: Mutex<Vec<(Dataset, String, Vec<u8>)>>,
    lock: ProcessLock,
    lock_timeout: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            datasets: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(Vec::new()),
            lock: ProcessLock::new(),
            lock_timeout,
        }
    }

    pub fn lock(&self) -> &ProcessLock {
        &self.lock
    }

    pub fn quarantined(&self) -> Result<Vec<(Dataset, String)>> {
        let quarantined = self.quarantined.lock()?;
        Ok(quarantined
            .iter()
            .map(|(dataset, stamp, _)| (*dataset, stamp.clone()))
            .collect())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetStore for InMemoryStore {
    fn read(&self, dataset: Dataset) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.acquire(dataset.name(), self.lock_timeout)?;
        Ok(self.datasets.lock()?.get(&dataset).cloned())
    }

    fn write(&self, dataset: Dataset, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock.acquire(dataset.name(), self.lock_timeout)?;
        self.datasets.lock()?.insert(dataset, bytes.to_vec());
        Ok(())
    }

    fn remove(&self, dataset: Dataset) -> Result<bool> {
        let _guard = self.lock.acquire(dataset.name(), self.lock_timeout)?;
        Ok(self.datasets.lock()?.remove(&dataset).is_some())
    }

    fn copy_to(&self, dataset: Dataset, dest: &Path) -> Result<bool> {
        let _guard = self.lock.acquire(dataset.name(), self.lock_timeout)?;
        let Some(bytes) = self.datasets.lock()?.get(&dataset).cloned() else {
            return Ok(false);
        };
        fs::write(dest, bytes).map_err(|err| {
            LedgerError::Io(format!("Failed to write '{}': {}", dest.display(), err))
        })?;
        Ok(true)
    }

    fn quarantine(&self, dataset: Dataset, stamp: &str) -> Result<Option<PathBuf>> {
        let _guard = self.lock.acquire(dataset.name(), self.lock_timeout)?;
        let Some(bytes) = self.datasets.lock()?.remove(&dataset) else {
            return Ok(None);
        };
        self.quarantined
            .lock()?
            .push((dataset, stamp.to_string(), bytes));
        Ok(Some(PathBuf::from(format!(
            "memory://{}.corrupt-{}",
            dataset.file_name(),
            stamp
        ))))
    }

    fn location(&self, dataset: Dataset) -> String {
        format!("memory://{}", dataset.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{read_json, write_json};

    #[test]
    fn test_round_trip_and_remove() {
        let store = InMemoryStore::new();
        assert!(read_json::<Vec<u64>>(&store, Dataset::Ledger).unwrap().is_none());

        write_json(&store, Dataset::Ledger, &vec![7u64]).unwrap();
        assert_eq!(read_json::<Vec<u64>>(&store, Dataset::Ledger).unwrap(), Some(vec![7]));

        assert!(store.remove(Dataset::Ledger).unwrap());
        assert!(!store.remove(Dataset::Ledger).unwrap());
    }

    #[test]
    fn test_held_lock_blocks_writes() {
        let store = InMemoryStore::with_lock_timeout(Duration::from_millis(20));
        let _guard = store
            .lock()
            .acquire(Dataset::Ledger.name(), Duration::from_millis(20))
            .unwrap();

        let err = store.write(Dataset::Ledger, b"[]").unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));
        assert!(store.write(Dataset::Admins, b"[]").is_ok());
    }

    #[test]
    fn test_quarantine_keeps_bytes() {
        let store = InMemoryStore::new();
        store.write(Dataset::Ledger, b"oops").unwrap();
        let location = store.quarantine(Dataset::Ledger, "s1").unwrap().unwrap();
        assert_eq!(location, PathBuf::from("memory://response_data.json.corrupt-s1"));
        assert_eq!(store.quarantined().unwrap(), vec![(Dataset::Ledger, "s1".to_string())]);
        assert!(store.read(Dataset::Ledger).unwrap().is_none());
    }
}
