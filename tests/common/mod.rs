#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use replyledger::{
    ChatId, Dataset, DatasetStore, InMemoryStore, LedgerConfig, LedgerEngine, LedgerError,
    ManualClock, MessageId, ReplyEvent, ReplyMessage, Result, TriggeringMessage, UserId,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const TRACKED: UserId = 42;
pub const CHAT: ChatId = -100;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn message(message_id: MessageId, sent_at: DateTime<Utc>) -> TriggeringMessage {
    TriggeringMessage {
        chat_id: CHAT,
        message_id,
        sender_id: Some(7),
        sent_at,
        text: format!("question {}", message_id),
    }
}

/// A reply by the tracked user carrying the replied-to message inline.
pub fn inline_reply(message_id: MessageId, sent_at: DateTime<Utc>, received_at: DateTime<Utc>) -> ReplyEvent {
    ReplyEvent {
        tracked_user_id: TRACKED,
        username: Some("worker".to_string()),
        chat_id: CHAT,
        triggering: Some(message(message_id, sent_at)),
        reply: ReplyMessage {
            message_id: message_id + 10_000,
            reply_to_message_id: Some(message_id),
            text: "answer".to_string(),
        },
        received_at,
    }
}

/// A reply that only names the replied-to message id.
pub fn reply_by_id(user: UserId, message_id: MessageId, received_at: DateTime<Utc>) -> ReplyEvent {
    ReplyEvent {
        tracked_user_id: user,
        username: None,
        chat_id: CHAT,
        triggering: None,
        reply: ReplyMessage {
            message_id: message_id + 10_000,
            reply_to_message_id: Some(message_id),
            text: "answer".to_string(),
        },
        received_at,
    }
}

pub fn config(dir: &Path) -> LedgerConfig {
    LedgerConfig::new(dir.join("data"))
        .backup_dir(dir.join("backups"))
        .lock_timeout(std::time::Duration::from_millis(500))
}

pub fn ledger_path(dir: &Path) -> PathBuf {
    dir.join("data").join(Dataset::Ledger.file_name())
}

pub async fn open_tracking(config: LedgerConfig, clock: &ManualClock) -> LedgerEngine {
    let engine = LedgerEngine::builder(config)
        .clock(Arc::new(clock.clone()))
        .open()
        .await
        .unwrap();
    engine.add_tracked_user(TRACKED).await.unwrap();
    engine
}

/// In-memory store whose writes to selected datasets can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing: Mutex<HashSet<Dataset>>,
    copy_stall: Mutex<Option<std::time::Duration>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, dataset: Dataset, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(dataset);
        } else {
            failing.remove(&dataset);
        }
    }

    /// Make every backup copy block for `stall` before it starts.
    pub fn stall_copies(&self, stall: Option<std::time::Duration>) {
        *self.copy_stall.lock().unwrap() = stall;
    }

    fn check(&self, dataset: Dataset) -> Result<()> {
        if self.failing.lock().unwrap().contains(&dataset) {
            return Err(LedgerError::Io(format!("simulated write failure on {}", dataset)));
        }
        Ok(())
    }
}

impl DatasetStore for FlakyStore {
    fn read(&self, dataset: Dataset) -> Result<Option<Vec<u8>>> {
        self.inner.read(dataset)
    }

    fn write(&self, dataset: Dataset, bytes: &[u8]) -> Result<()> {
        self.check(dataset)?;
        self.inner.write(dataset, bytes)
    }

    fn remove(&self, dataset: Dataset) -> Result<bool> {
        self.inner.remove(dataset)
    }

    fn copy_to(&self, dataset: Dataset, dest: &Path) -> Result<bool> {
        let stall = *self.copy_stall.lock().unwrap();
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }
        self.inner.copy_to(dataset, dest)
    }

    fn quarantine(&self, dataset: Dataset, stamp: &str) -> Result<Option<PathBuf>> {
        self.inner.quarantine(dataset, stamp)
    }

    fn location(&self, dataset: Dataset) -> String {
        self.inner.location(dataset)
    }
}
