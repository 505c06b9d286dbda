use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Timed out after {waited_ms}ms waiting for lock on dataset '{dataset}'")]
    LockTimeout { dataset: String, waited_ms: u64 },

    #[error("Dataset '{dataset}' at '{path}' is corrupt: {reason}")]
    CorruptData {
        dataset: String,
        path: String,
        reason: String,
    },

    #[error("Flush failed ({consecutive} consecutive): {reason}")]
    FlushFailure { consecutive: u32, reason: String },

    #[error("Backup failed: {0}")]
    BackupFailure(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl LedgerError {
    /// Transient errors are retried by the next scheduled operation; anything
    /// else threatens data integrity and must be escalated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::LockTimeout { .. }
                | LedgerError::FlushFailure { .. }
                | LedgerError::BackupFailure(_)
                | LedgerError::Io(_)
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, LedgerError::CorruptData { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl<T> From<std::sync::PoisonError<T>> for LedgerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Io(format!("blocking task failed: {}", err))
    }
}
