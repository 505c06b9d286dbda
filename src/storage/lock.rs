//! Named advisory locks scoped to a dataset.
//!
//! [`FileLock`] guards datasets across processes with an `flock`-style lock
//! on a sidecar `<name>.lock` file. [`ProcessLock`] is the in-process
//! equivalent used by backends that never touch the filesystem.

use crate::core::{LedgerError, Result};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

pub trait DatasetLock: Send + Sync {
    /// Blocks until the named lock is held or `timeout` elapses.
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard>;
}

enum Held {
    File(File),
    Process { registry: Arc<ProcessRegistry>, name: String },
    Custom(Option<Box<dyn FnOnce() + Send>>),
}

/// Releases the lock when dropped, on every exit path.
pub struct LockGuard {
    name: String,
    acquired_at: Instant,
    held: Held,
}

impl LockGuard {
    /// Wrap a lock held by some other backend; `release` runs on drop.
    pub fn custom(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            acquired_at: Instant::now(),
            held: Held::Custom(Some(Box::new(release))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &mut self.held {
            Held::File(file) => {
                let _ = FileExt::unlock(&*file);
            }
            Held::Process { registry, name } => registry.release(name),
            Held::Custom(release) => {
                if let Some(release) = release.take() {
                    release();
                }
            }
        }
        debug!(lock = %self.name, held_ms = self.held_for().as_millis() as u64, "released lock");
    }
}

fn timeout_error(name: &str, start: Instant) -> LedgerError {
    LedgerError::LockTimeout {
        dataset: name.to_string(),
        waited_ms: start.elapsed().as_millis() as u64,
    }
}

// ============================================================================
// File Lock
// ============================================================================

/// Inter-process lock backed by sidecar lock files in `dir`.
#[derive(Debug, Clone)]
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                LedgerError::Io(format!(
                    "Failed to create lock directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|err| {
                LedgerError::Io(format!("Failed to open lock file '{}': {}", path.display(), err))
            })
    }
}

impl DatasetLock for FileLock {
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let path = self.lock_path(name);
        let file = Self::open_lock_file(&path)?;
        let start = Instant::now();
        let mut backoff = Duration::from_millis(5);

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(LockGuard {
                        name: name.to_string(),
                        acquired_at: Instant::now(),
                        held: Held::File(file),
                    });
                }
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(timeout_error(name, start));
                    }
                    std::thread::sleep(backoff.min(timeout - elapsed));
                    backoff = (backoff * 2).min(Duration::from_millis(200));
                }
                Err(err) => {
                    return Err(LedgerError::Io(format!(
                        "Failed to lock '{}': {}",
                        path.display(),
                        err
                    )));
                }
            }
        }
    }
}

// ============================================================================
// Process Lock
// ============================================================================

#[derive(Default)]
struct ProcessRegistry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ProcessRegistry {
    fn release(&self, name: &str) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(name);
        self.released.notify_all();
    }
}

/// Named locks that only exclude callers within the current process.
#[derive(Clone, Default)]
pub struct ProcessLock {
    registry: Arc<ProcessRegistry>,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatasetLock for ProcessLock {
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        let mut held = self.registry.held.lock()?;

        while held.contains(name) {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(timeout_error(name, start));
            }
            let (guard, _) = self
                .registry
                .released
                .wait_timeout(held, timeout - elapsed)?;
            held = guard;
        }

        held.insert(name.to_string());
        Ok(LockGuard {
            name: name.to_string(),
            acquired_at: Instant::now(),
            held: Held::Process {
                registry: self.registry.clone(),
                name: name.to_string(),
            },
        })
    }
}
