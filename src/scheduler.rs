//! Periodic flush and cleanup.
//!
//! [`Scheduler`] only decides which tasks are due according to its
//! [`Clock`]; [`run_due`] executes them against an engine. Tests drive both
//! with a manual clock. [`spawn_engine_worker`] wraps them in a background
//! task that polls on real time.

use crate::clock::Clock;
use crate::core::Result;
use crate::engine::{LedgerEngine, ShutdownOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTask {
    Flush,
    Cleanup,
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    flush_every: chrono::Duration,
    cleanup_every: chrono::Duration,
    next_flush: DateTime<Utc>,
    next_cleanup: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, flush_every: Duration, cleanup_every: Duration) -> Self {
        let flush_every = to_chrono(flush_every);
        let cleanup_every = to_chrono(cleanup_every);
        let now = clock.now();
        Self {
            clock,
            flush_every,
            cleanup_every,
            next_flush: now + flush_every,
            next_cleanup: now + cleanup_every,
        }
    }

    pub fn for_engine(engine: &LedgerEngine, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            engine.config().flush_period(),
            engine.config().cleanup_period(),
        )
    }

    /// Tasks due now, flush first. Each due task is rescheduled one period
    /// from now; ticks missed while the process was busy are not replayed.
    pub fn due(&mut self) -> Vec<ScheduledTask> {
        let now = self.clock.now();
        let mut due = Vec::new();
        if now >= self.next_flush {
            due.push(ScheduledTask::Flush);
            self.next_flush = now + self.flush_every;
        }
        if now >= self.next_cleanup {
            due.push(ScheduledTask::Cleanup);
            self.next_cleanup = now + self.cleanup_every;
        }
        due
    }

    /// Time until the next task becomes due.
    pub fn until_next(&self) -> Duration {
        let next = self.next_flush.min(self.next_cleanup);
        (next - self.clock.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub ran: Vec<ScheduledTask>,
    pub failed: Vec<ScheduledTask>,
}

/// Run whatever is due. Failures are logged and reported, never propagated:
/// a failed flush keeps its batch for the next tick.
pub async fn run_due(engine: &LedgerEngine, scheduler: &mut Scheduler) -> TickReport {
    let mut report = TickReport::default();
    for task in scheduler.due() {
        let ok = match task {
            ScheduledTask::Flush => match engine.flush().await {
                Ok(outcome) => {
                    if outcome.flushed > 0 {
                        debug!(flushed = outcome.flushed, "scheduled flush");
                    }
                    true
                }
                Err(err) => {
                    warn!(error = %err, "scheduled flush failed");
                    false
                }
            },
            ScheduledTask::Cleanup => match engine.cleanup().await {
                Ok(_) => true,
                Err(err) => {
                    warn!(error = %err, "scheduled cleanup failed");
                    false
                }
            },
        };
        report.ran.push(task);
        if !ok {
            report.failed.push(task);
        }
    }
    report
}

/// Background worker running the scheduler on real time.
pub struct EngineWorker {
    engine: Arc<LedgerEngine>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl EngineWorker {
    /// Stop polling, wait for an in-flight task, then run the final
    /// shutdown flush.
    pub async fn stop(mut self) -> Result<ShutdownOutcome> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await?;
        }
        self.engine.shutdown().await
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawn the periodic worker. `max_poll` caps how long it sleeps between
/// checks so clock adjustments are noticed.
pub fn spawn_engine_worker(
    engine: Arc<LedgerEngine>,
    mut scheduler: Scheduler,
    max_poll: Duration,
) -> EngineWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let engine_for_worker = engine.clone();
    let max_poll = max_poll.max(Duration::from_millis(10));

    let join_handle = tokio::spawn(async move {
        loop {
            let wait = scheduler.until_next().min(max_poll);
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(wait) => {
                    run_due(&engine_for_worker, &mut scheduler).await;
                }
            }
        }
    });

    EngineWorker {
        engine,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
