use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use clap::{Parser, Subcommand};
use replyledger::{
    Dataset, LedgerConfig, LedgerEngine, ReplyEvent, RosterChange, Scheduler, ShutdownOutcome,
    SystemClock, TriggeringMessage, UserStats, format_latency, spawn_engine_worker,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replyledger")]
#[command(about = "Reply-latency ledger: ingest events, report stats, manage backups")]
struct Cli {
    /// JSON config file; missing fields take defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read NDJSON events from stdin until EOF, flushing periodically
    Ingest,
    /// Response statistics from the last flushed ledger
    Stats {
        #[arg(long)]
        user: Option<i64>,
    },
    /// List backups, newest first
    Backups,
    /// Flush and take a backup now
    Backup,
    /// Apply the backup retention policy
    Prune,
    /// Replace a dataset with its newest valid backup copy
    Restore {
        /// response_data, message_cache, target_users or admin_users
        dataset: String,
    },
    /// Back up, then delete records older than the given number of days
    Purge {
        #[arg(long)]
        days: u32,
    },
    /// Delete records by id
    Delete { ids: Vec<u64> },
    /// Manage tracked users
    Users {
        #[command(subcommand)]
        action: RosterAction,
    },
    /// Manage administrators
    Admins {
        #[command(subcommand)]
        action: RosterAction,
    },
}

#[derive(Subcommand)]
enum RosterAction {
    List,
    Add { user_id: i64 },
    Remove { user_id: i64 },
}

/// One line of `ingest` input.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IngestLine {
    Message(TriggeringMessage),
    Reply(ReplyEvent),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => LedgerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => LedgerConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let engine = Arc::new(
        LedgerEngine::open(config)
            .await
            .context("Failed to open ledger")?,
    );

    match cli.command {
        Command::Ingest => ingest(engine).await,
        Command::Stats { user } => print_stats(&engine, user),
        Command::Backups => {
            let backups = engine.list_backups().await?;
            if backups.is_empty() {
                println!("No backups yet.");
            }
            for entry in backups {
                println!(
                    "{}  {}  {} files",
                    entry.id,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.files.len()
                );
            }
            Ok(())
        }
        Command::Backup => {
            let entry = engine.backup_now().await.context("Backup failed")?;
            println!("Created backup {} ({} files)", entry.id, entry.files.len());
            Ok(())
        }
        Command::Prune => {
            let report = engine.rotator().prune_async().await?;
            println!(
                "Kept {}, deleted {}, failed {}",
                report.kept,
                report.deleted.len(),
                report.failed.len()
            );
            Ok(())
        }
        Command::Restore { dataset } => {
            let dataset = Dataset::from_name(&dataset)
                .ok_or_else(|| anyhow!("Unknown dataset '{}'", dataset))?;
            match engine.restore_from_backup(dataset).await? {
                Some(entry) => println!("Restored {} from backup {}", dataset, entry.id),
                None => println!("No valid backup of {} found", dataset),
            }
            Ok(())
        }
        Command::Purge { days } => {
            let cutoff = engine.now() - Duration::days(days as i64);
            let report = engine
                .purge_with_backup(cutoff)
                .await
                .context("Purge aborted")?;
            println!(
                "Removed {} records older than {} days (backup {})",
                report.removed, days, report.backup_id
            );
            Ok(())
        }
        Command::Delete { ids } => {
            let removed = engine.delete_records(&ids).await?;
            println!("Deleted {} records", removed);
            Ok(())
        }
        Command::Users { action } => {
            match action {
                RosterAction::List => print_ids("Tracked users", engine.roster().tracked()?),
                RosterAction::Add { user_id } => {
                    report_change(user_id, engine.add_tracked_user(user_id).await?)
                }
                RosterAction::Remove { user_id } => {
                    report_change(user_id, engine.remove_tracked_user(user_id).await?)
                }
            }
            Ok(())
        }
        Command::Admins { action } => {
            match action {
                RosterAction::List => print_ids("Administrators", engine.roster().admins()?),
                RosterAction::Add { user_id } => {
                    report_change(user_id, engine.add_admin(user_id).await?)
                }
                RosterAction::Remove { user_id } => {
                    report_change(user_id, engine.remove_admin(user_id).await?)
                }
            }
            Ok(())
        }
    }
}

async fn ingest(engine: Arc<LedgerEngine>) -> Result<()> {
    let scheduler = Scheduler::for_engine(&engine, Arc::new(SystemClock));
    let worker = spawn_engine_worker(engine.clone(), scheduler, std::time::Duration::from_secs(1));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut recorded = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IngestLine>(&line) {
            Ok(IngestLine::Message(message)) => engine.observe_message(message)?,
            Ok(IngestLine::Reply(event)) => {
                if engine.record_reply(&event)?.is_some() {
                    recorded += 1;
                }
            }
            Err(err) => warn!(error = %err, "skipping malformed input line"),
        }
    }

    match worker.stop().await? {
        ShutdownOutcome::Flushed(outcome) => {
            println!("Recorded {} replies; ledger holds {}", recorded, outcome.total)
        }
        ShutdownOutcome::RecoveryWritten { records } => {
            println!(
                "Recorded {} replies; final flush failed, {} saved for recovery",
                recorded, records
            )
        }
    }
    Ok(())
}

fn print_stats(engine: &LedgerEngine, user: Option<i64>) -> Result<()> {
    match user {
        Some(user_id) => print_user(&engine.stats_for(user_id)?),
        None => {
            let overall = engine.overall_stats()?;
            println!("Total responses: {}", overall.total);
            println!(
                "Average response time: {}",
                overall
                    .average_latency
                    .map(format_latency)
                    .unwrap_or_else(|| "n/a".to_string())
            );
            println!("Responses today: {}", overall.count_today);
            println!("Active users: {}", overall.active_users);
            for stats in engine.stats_for_all()? {
                print_user(&stats);
            }
        }
    }
    Ok(())
}

fn print_user(stats: &UserStats) {
    println!(
        "User {}: {} responses, average {}, {} today",
        stats.user_id,
        stats.count,
        stats
            .average_latency
            .map(format_latency)
            .unwrap_or_else(|| "n/a".to_string()),
        stats.count_today
    );
}

fn print_ids(title: &str, ids: impl IntoIterator<Item = i64>) {
    println!("{}:", title);
    for id in ids {
        println!("  {}", id);
    }
}

fn report_change(user_id: i64, change: RosterChange) {
    match change {
        RosterChange::Added => println!("Added {}", user_id),
        RosterChange::Removed => println!("Removed {}", user_id),
        RosterChange::Unchanged => println!("No change for {}", user_id),
        RosterChange::RejectedAdmin => println!("{} is an administrator and cannot be tracked", user_id),
    }
}
