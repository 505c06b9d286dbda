mod common;

use chrono::Duration;
use common::*;
use replyledger::{
    AlertKind, Dataset, DatasetStore, LedgerConfig, LedgerEngine, LedgerError,
    ManualClock, MemoryAlerts, ResponseRecord, ShutdownOutcome,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn open_flaky(
    store: Arc<FlakyStore>,
    alerts: Arc<MemoryAlerts>,
    clock: &ManualClock,
    config: LedgerConfig,
) -> LedgerEngine {
    LedgerEngine::builder(config)
        .store(store)
        .alerts(alerts)
        .clock(Arc::new(clock.clone()))
        .open()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_failed_flush_keeps_batch_and_alerts_after_threshold() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::new());
    let alerts = Arc::new(MemoryAlerts::new());
    let clock = ManualClock::new(t0());
    let engine = open_flaky(
        store.clone(),
        alerts.clone(),
        &clock,
        config(dir.path()).alert_after_failures(2),
    )
    .await;
    engine.add_tracked_user(TRACKED).await.unwrap();

    engine.record_reply(&inline_reply(1, t0(), t0())).unwrap();
    store.fail_writes(Dataset::Ledger, true);

    let err = engine.flush().await.unwrap_err();
    assert!(matches!(err, LedgerError::FlushFailure { consecutive: 1, .. }));
    assert_eq!(engine.buffered_len().unwrap(), 1);
    assert!(alerts.kinds().await.is_empty());

    // appends keep working while the disk is failing
    engine.record_reply(&inline_reply(2, t0(), t0())).unwrap();
    assert!(engine.flush().await.is_err());
    assert_eq!(engine.buffered_len().unwrap(), 2);
    assert_eq!(alerts.kinds().await, vec![AlertKind::FlushFailing]);

    store.fail_writes(Dataset::Ledger, false);
    let outcome = engine.flush().await.unwrap();
    assert_eq!(outcome.flushed, 2);

    let bytes = store.read(Dataset::Ledger).unwrap().unwrap();
    let records: Vec<ResponseRecord> = serde_json::from_slice(&bytes).unwrap();
    let message_ids = records.iter().map(|r| r.original_message_id).collect::<Vec<_>>();
    assert_eq!(message_ids, vec![1, 2]);
}

#[tokio::test]
async fn test_shutdown_writes_recovery_file_and_next_start_ingests_it() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::new());
    let alerts = Arc::new(MemoryAlerts::new());
    let clock = ManualClock::new(t0());

    {
        let engine = open_flaky(store.clone(), alerts.clone(), &clock, config(dir.path())).await;
        engine.add_tracked_user(TRACKED).await.unwrap();
        engine.record_reply(&inline_reply(1, t0(), t0())).unwrap();
        engine.flush().await.unwrap();
        engine.record_reply(&inline_reply(2, t0(), t0())).unwrap();
        engine.record_reply(&inline_reply(3, t0(), t0())).unwrap();

        store.fail_writes(Dataset::Ledger, true);
        let outcome = engine.shutdown().await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::RecoveryWritten { records: 2 });
        assert!(alerts.kinds().await.contains(&AlertKind::RecoveryWritten));
    }
    store.fail_writes(Dataset::Ledger, false);
    assert!(store.read(Dataset::Recovery).unwrap().is_some());

    let engine = open_flaky(store.clone(), alerts.clone(), &clock, config(dir.path())).await;
    assert_eq!(engine.records().unwrap().len(), 1);
    assert_eq!(engine.buffered_len().unwrap(), 2);

    let next = engine
        .record_reply(&inline_reply(4, t0(), t0()))
        .unwrap()
        .unwrap();
    assert_eq!(next.record_id, 4);

    engine.flush().await.unwrap();
    assert_eq!(engine.records().unwrap().len(), 4);
    assert!(store.read(Dataset::Recovery).unwrap().is_none());
}

#[tokio::test]
async fn test_recovery_records_already_in_ledger_are_not_duplicated() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::new());
    let alerts = Arc::new(MemoryAlerts::new());
    let clock = ManualClock::new(t0());

    let flushed = {
        let engine = open_flaky(store.clone(), alerts.clone(), &clock, config(dir.path())).await;
        engine.add_tracked_user(TRACKED).await.unwrap();
        engine.record_reply(&inline_reply(1, t0(), t0())).unwrap();
        engine.flush().await.unwrap();
        engine.records().unwrap().into_iter().collect::<Vec<_>>()
    };
    // a recovery file left behind after its records already reached the ledger
    store
        .write(Dataset::Recovery, &serde_json::to_vec(&flushed).unwrap())
        .unwrap();

    let engine = open_flaky(store.clone(), alerts, &clock, config(dir.path())).await;
    assert_eq!(engine.buffered_len().unwrap(), 0);
    assert_eq!(engine.records().unwrap().len(), 1);
    assert!(store.read(Dataset::Recovery).unwrap().is_none());
}

#[tokio::test]
async fn test_corrupt_ledger_is_restored_from_backup() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(t0());
    let cfg = config(dir.path()).backup_interval_saves(1);

    {
        let engine = open_tracking(cfg.clone(), &clock).await;
        engine.record_reply(&inline_reply(1, t0(), t0())).unwrap();
        let outcome = engine.flush().await.unwrap();
        assert!(outcome.backup.is_some());
    }
    std::fs::write(ledger_path(dir.path()), b"{ truncated").unwrap();

    let alerts = Arc::new(MemoryAlerts::new());
    clock.advance(Duration::minutes(5));
    let engine = LedgerEngine::builder(cfg)
        .clock(Arc::new(clock.clone()))
        .alerts(alerts.clone())
        .open()
        .await
        .unwrap();

    assert_eq!(engine.records().unwrap().len(), 1);
    assert_eq!(alerts.kinds().await, vec![AlertKind::CorruptData]);

    let preserved = std::fs::read_dir(dir.path().join("data"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("response_data.json.corrupt-")
        })
        .count();
    assert_eq!(preserved, 1);
}

#[tokio::test]
async fn test_corrupt_ledger_without_backup_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    std::fs::write(ledger_path(dir.path()), b"not json").unwrap();

    let alerts = Arc::new(MemoryAlerts::new());
    let result = LedgerEngine::builder(cfg)
        .alerts(alerts.clone())
        .open()
        .await;
    match result {
        Err(err) => assert!(err.is_corruption()),
        Ok(_) => panic!("corrupt ledger must not open as empty"),
    }
    assert_eq!(alerts.kinds().await, vec![AlertKind::CorruptData]);
    // the corrupt file is left in place for the operator
    assert!(ledger_path(dir.path()).exists());
}

#[tokio::test]
async fn test_interrupted_write_leaves_previous_ledger_intact() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(t0());
    {
        let engine = open_tracking(config(dir.path()), &clock).await;
        engine.record_reply(&inline_reply(1, t0(), t0())).unwrap();
        engine.flush().await.unwrap();
    }

    // a crash between writing the temp file and renaming it leaves this behind
    let temp = dir.path().join("data").join(".response_data.json.crash01.tmp");
    std::fs::write(&temp, b"[ partial").unwrap();

    let engine = LedgerEngine::builder(config(dir.path()))
        .clock(Arc::new(clock.clone()))
        .open()
        .await
        .unwrap();
    assert_eq!(engine.records().unwrap().len(), 1);
    assert!(!temp.exists(), "stale temp file is swept on open");
}
