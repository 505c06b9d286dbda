// ============================================================================
// replyledger: buffered reply-latency ledger with atomic persistence
// ============================================================================

pub mod alerts;
pub mod backup;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod core;
pub mod engine;
pub mod ledger;
pub mod roster;
pub mod scheduler;
pub mod storage;

// Re-export main types for convenience
pub use alerts::{Alert, AlertKind, AlertSink, LogAlerts, MemoryAlerts};
pub use backup::{BackupEntry, BackupRotator, PruneReport, RetentionPlan, RetentionPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use core::{ChatId, Dataset, LedgerError, MessageId, RecordId, Result, UserId};
pub use engine::{
    CleanupReport, FlushOutcome, LedgerEngine, LedgerEngineBuilder, PurgeReport, ShutdownOutcome,
};
pub use ledger::{
    format_latency, FixedOffsetCalendar, LocalCalendar, OverallStats, ReplyEvent, ReplyMessage,
    ResponseRecord, TriggeringMessage, UserStats,
};
pub use roster::{Roster, RosterChange};
pub use scheduler::{run_due, spawn_engine_worker, EngineWorker, ScheduledTask, Scheduler, TickReport};
pub use storage::{AtomicFileStore, DatasetStore, InMemoryStore};
