use crate::core::{Dataset, LedgerError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

/// Dataset store trait - allows pluggable storage backends
///
/// Every operation is scoped to one dataset and runs under that dataset's
/// lock. Implementations must make `write` atomic: a concurrent or later
/// `read` observes either the previous complete content or the new one.
pub trait DatasetStore: Send + Sync {
    /// Read the last atomically written content, `None` if never written
    fn read(&self, dataset: Dataset) -> Result<Option<Vec<u8>>>;

    /// Replace the dataset content atomically
    fn write(&self, dataset: Dataset, bytes: &[u8]) -> Result<()>;

    /// Delete the dataset; returns whether it existed
    fn remove(&self, dataset: Dataset) -> Result<bool>;

    /// Copy the current content to `dest` under the dataset lock.
    /// Returns `false` when the dataset has never been written.
    fn copy_to(&self, dataset: Dataset, dest: &Path) -> Result<bool>;

    /// Move the current content aside so it survives a restore.
    /// Returns where the preserved copy lives.
    fn quarantine(&self, dataset: Dataset, stamp: &str) -> Result<Option<PathBuf>>;

    /// Human-readable location of the dataset, used in error messages
    fn location(&self, dataset: Dataset) -> String;

    /// Copy an external file (a rendered report) into a backup.
    /// Returns `false` when the source does not exist.
    fn copy_artifact(&self, src: &Path, dest: &Path) -> Result<bool> {
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

/// Read and deserialize a dataset. A file that exists but does not parse is
/// reported as [`LedgerError::CorruptData`].
pub fn read_json<T: DeserializeOwned>(store: &dyn DatasetStore, dataset: Dataset) -> Result<Option<T>> {
    let Some(bytes) = store.read(dataset)? else {
        return Ok(None);
    };
    decode_json(store, dataset, &bytes).map(Some)
}

pub fn decode_json<T: DeserializeOwned>(
    store: &dyn DatasetStore,
    dataset: Dataset,
    bytes: &[u8],
) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|err| LedgerError::CorruptData {
        dataset: dataset.name().to_string(),
        path: store.location(dataset),
        reason: err.to_string(),
    })
}

pub fn encode_json<T: Serialize>(dataset: Dataset, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|err| {
        LedgerError::Serialization(format!("serialize dataset '{}': {}", dataset, err))
    })
}

pub fn write_json<T: Serialize>(store: &dyn DatasetStore, dataset: Dataset, value: &T) -> Result<()> {
    let bytes = encode_json(dataset, value)?;
    store.write(dataset, &bytes)
}
