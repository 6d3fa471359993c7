/*!
divevault CLI - back up, restore and prune the dive-shop data store.

Every subcommand loads a TOML configuration (see `--config`), opens the vault
under its storage root and runs one operation. Restores always take a
`pre_restore` safety backup first; a restore that fails after touching live
data prints which backup to recover from.
*/

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use divevault_core::{
    observability, BackupId, BackupKind, BackupRecord, BackupVault, RestoreEvent,
    RestoreOutcome, VaultError,
};
use divevault_retry::{busy_lock_backoff_policy, permanent_error, RetryError};
use serde::Serialize;
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "divevault")]
#[command(about = "Verified backups, guarded restores and retention for the dive-shop data store")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "DIVEVAULT_CONFIG", default_value = "divevault.toml")]
    config: PathBuf,

    /// Override the storage root from the configuration
    #[arg(short, long, global = true, env = "DIVEVAULT_ROOT")]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Output format for listings and reports
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Write Prometheus metrics for this run to a file (textfile collector format)
    #[arg(long, global = true, value_name = "PATH")]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum KindArg {
    Manual,
    Automatic,
    PreRestore,
}

impl From<KindArg> for BackupKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Manual => BackupKind::Manual,
            KindArg::Automatic => BackupKind::Automatic,
            KindArg::PreRestore => BackupKind::PreRestore,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Take a backup now
    Create {
        #[arg(short, long, value_enum, default_value = "manual")]
        kind: KindArg,
        /// Who requested the backup
        #[arg(short, long, env = "DIVEVAULT_ACTOR")]
        actor: Option<String>,
    },
    /// List backups, newest first
    List {
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Show one backup record
    Show { id: BackupId },
    /// Recompute a backup's checksum and compare it to the registry
    Verify { id: BackupId },
    /// Restore the live store from a backup
    Restore {
        id: BackupId,
        #[arg(short, long, env = "DIVEVAULT_ACTOR")]
        actor: Option<String>,
        /// Wait up to SECS for a running restore to finish instead of failing
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "300")]
        retry_busy: Option<u64>,
    },
    /// Delete a backup's artifact and mark it deleted
    Delete {
        id: BackupId,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Keep the newest N backups of a kind and delete the rest
    Prune {
        #[arg(short, long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        keep: usize,
    },
    /// Registry statistics
    Stats,
    /// Copy a backup's artifact to another path
    Export { id: BackupId, destination: PathBuf },
    /// Restore audit trail
    History {
        /// Only attempts against this backup
        #[arg(short, long)]
        backup: Option<BackupId>,
    },
    /// Cron entry: take an automatic backup, then apply the retention policy
    Scheduled,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: BackupId,
    #[tabled(rename = "Kind")]
    kind: BackupKind,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "By")]
    actor: String,
    #[tabled(rename = "Filename")]
    filename: String,
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            status: record.status.to_string(),
            created: format_timestamp(record.created_at.timestamp()),
            size: record
                .size_bytes
                .map(format_size)
                .unwrap_or_else(|| "-".to_string()),
            actor: record.created_by.clone().unwrap_or_else(|| "-".to_string()),
            filename: record.filename.clone(),
        }
    }
}

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Backup")]
    target: BackupId,
    #[tabled(rename = "Outcome")]
    state: String,
    #[tabled(rename = "Safety backup")]
    safety: String,
    #[tabled(rename = "By")]
    actor: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&RestoreEvent> for EventRow {
    fn from(event: &RestoreEvent) -> Self {
        Self {
            started: format_timestamp(event.started_at.timestamp()),
            target: event.target,
            state: event.state.to_string(),
            safety: event
                .safety_backup
                .map(|id| format!("#{id}"))
                .unwrap_or_else(|| "-".to_string()),
            actor: event.actor.clone().unwrap_or_else(|| "-".to_string()),
            error: event.error_message.clone().unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    observability::init_observability(cli.json_logs, cli.verbose)?;

    let config = config::load_config(&cli.config, cli.root.as_ref())?;
    let vault = Arc::new(
        BackupVault::from_config(config).context("opening the backup vault")?,
    );

    let result = run(&cli, &vault).await;

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path) {
            warn!(path = %path.display(), error = %e, "failed to write metrics file");
        }
    }

    result
}

async fn run(cli: &Cli, vault: &Arc<BackupVault>) -> Result<(), anyhow::Error> {
    let format = cli.format;
    match &cli.command {
        Commands::Create { kind, actor } => {
            create_backup(vault, (*kind).into(), actor.clone(), format).await
        }
        Commands::List { kind } => list_backups(vault, kind.map(BackupKind::from), format),
        Commands::Show { id } => show_backup(vault, *id, format),
        Commands::Verify { id } => verify_backup(vault, *id),
        Commands::Restore {
            id,
            actor,
            retry_busy,
        } => {
            let max_wait = retry_busy.map(Duration::from_secs);
            restore_backup(vault, *id, actor.clone(), max_wait, format).await
        }
        Commands::Delete { id, force } => delete_backup(vault, *id, *force).await,
        Commands::Prune { kind, keep } => {
            let deleted = vault.prune((*kind).into(), *keep)?;
            println!("✓ Pruned {deleted} backup(s)");
            Ok(())
        }
        Commands::Stats => show_statistics(vault, format),
        Commands::Export { id, destination } => {
            let bytes = vault.export_backup(*id, destination)?;
            println!(
                "✓ Exported backup #{id} to {} ({})",
                destination.display(),
                format_size(bytes)
            );
            Ok(())
        }
        Commands::History { backup } => show_history(vault, *backup, format),
        Commands::Scheduled => scheduled_run(vault, format).await,
    }
}

async fn create_backup(
    vault: &Arc<BackupVault>,
    kind: BackupKind,
    actor: Option<String>,
    format: OutputFormat,
) -> Result<(), anyhow::Error> {
    info!(kind = %kind, "creating backup");
    let record = vault
        .spawn_create(kind, actor)
        .await?
        .map_err(|e| anyhow!(e.create_failure_message()))?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => println!(
            "✓ Backup #{} created: {} ({})",
            record.id,
            record.filename,
            record.size_bytes.map(format_size).unwrap_or_default()
        ),
    }
    Ok(())
}

fn list_backups(
    vault: &BackupVault,
    kind: Option<BackupKind>,
    format: OutputFormat,
) -> Result<(), anyhow::Error> {
    let records = vault.list_backups(kind)?;
    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table if records.is_empty() => println!("No backups found"),
        OutputFormat::Table => {
            let rows: Vec<BackupRow> = records.iter().map(BackupRow::from).collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

fn show_backup(vault: &BackupVault, id: BackupId, format: OutputFormat) -> Result<(), anyhow::Error> {
    let record = vault.get_backup(id)?;
    if format == OutputFormat::Json {
        return print_json(&record);
    }

    println!("Backup Details:");
    println!("  ID: {}", record.id);
    println!("  Kind: {}", record.kind);
    println!("  Status: {}", record.status);
    println!("  Filename: {}", record.filename);
    println!("  Path: {}", record.storage_path.display());
    println!("  Created: {}", format_timestamp(record.created_at.timestamp()));
    if let Some(actor) = &record.created_by {
        println!("  Created by: {actor}");
    }
    if let Some(size) = record.size_bytes {
        println!("  Size: {}", format_size(size));
    }
    if let Some(checksum) = &record.checksum {
        println!("  Checksum (sha256): {checksum}");
    }
    if let Some(at) = record.restored_at {
        println!("  Last restored: {}", format_timestamp(at.timestamp()));
    }
    if let Some(at) = record.deleted_at {
        println!("  Deleted: {}", format_timestamp(at.timestamp()));
    }
    if let Some(message) = &record.error_message {
        println!("  Error: {message}");
    }
    Ok(())
}

fn verify_backup(vault: &BackupVault, id: BackupId) -> Result<(), anyhow::Error> {
    match vault.verify_backup(id) {
        Ok(_) => {
            println!("✓ Backup #{id} is intact and restorable");
            Ok(())
        }
        Err(VaultError::ChecksumMismatch { expected, actual }) => {
            eprintln!("✗ Integrity check failed:");
            eprintln!("  Expected hash: {expected}");
            eprintln!("  Actual hash: {actual}");
            bail!("backup #{id} failed verification")
        }
        Err(e) => Err(e.into()),
    }
}

async fn restore_backup(
    vault: &Arc<BackupVault>,
    id: BackupId,
    actor: Option<String>,
    max_wait: Option<Duration>,
    format: OutputFormat,
) -> Result<(), anyhow::Error> {
    let outcome = match max_wait {
        None => vault.spawn_restore(id, actor).await?,
        Some(max_wait) => restore_waiting_for_lock(vault, id, actor, max_wait).await,
    };

    match outcome {
        Ok(outcome) => {
            match format {
                OutputFormat::Json => print_json(&outcome)?,
                OutputFormat::Table => println!(
                    "✓ Backup #{} restored; the previous state is saved as backup #{}",
                    outcome.target, outcome.safety_backup_id
                ),
            }
            Ok(())
        }
        Err(e) => {
            if let Some(source) = std::error::Error::source(&e) {
                warn!(error = %source, "restore failure detail");
            }
            Err(anyhow!(e.restore_failure_message()))
        }
    }
}

/// Retry a restore while another one holds the lock
async fn restore_waiting_for_lock(
    vault: &Arc<BackupVault>,
    id: BackupId,
    actor: Option<String>,
    max_wait: Duration,
) -> Result<RestoreOutcome, VaultError> {
    let result = divevault_retry::with_custom_backoff(
        "restore",
        busy_lock_backoff_policy(max_wait),
        |attempt| {
            let vault = Arc::clone(vault);
            let actor = actor.clone();
            Box::pin(async move {
                if attempt > 1 {
                    info!(backup_id = %id, attempt, "retrying restore");
                }
                match vault.spawn_restore(id, actor).await {
                    Ok(result) => result.map_err(|e| RetryError::classify("restore", e)),
                    Err(join) => Err(permanent_error!("restore", join)),
                }
            })
        },
    )
    .await;

    result.map_err(into_vault_error)
}

/// Delete a backup, riding out the short lock hold of a concurrent delete or prune
async fn delete_waiting_for_lock(
    vault: &Arc<BackupVault>,
    id: BackupId,
) -> Result<BackupRecord, VaultError> {
    let result = divevault_retry::with_backoff("delete", |attempt| {
        let vault = Arc::clone(vault);
        Box::pin(async move {
            if attempt > 1 {
                info!(backup_id = %id, attempt, "retrying delete");
            }
            match tokio::task::spawn_blocking(move || vault.delete_backup(id)).await {
                Ok(result) => result.map_err(|e| RetryError::classify("delete", e)),
                Err(join) => Err(permanent_error!("delete", join)),
            }
        })
    })
    .await;

    result.map_err(into_vault_error)
}

fn into_vault_error(err: RetryError) -> VaultError {
    match err.into_source().downcast::<VaultError>() {
        Ok(vault_error) => *vault_error,
        Err(other) => VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
    }
}

async fn delete_backup(
    vault: &Arc<BackupVault>,
    id: BackupId,
    force: bool,
) -> Result<(), anyhow::Error> {
    if !force {
        let record = vault.get_backup(id)?;
        print!(
            "Are you sure you want to delete backup #{id} ({})? (y/N): ",
            record.filename
        );
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Deletion cancelled");
            return Ok(());
        }
    }

    delete_waiting_for_lock(vault, id).await?;
    println!("✓ Backup #{id} deleted");
    Ok(())
}

fn show_statistics(vault: &BackupVault, format: OutputFormat) -> Result<(), anyhow::Error> {
    let stats = vault.statistics()?;
    if format == OutputFormat::Json {
        return print_json(&stats);
    }

    println!("Backup Statistics:");
    println!("  Records: {}", stats.total_records);
    for (status, count) in &stats.by_status {
        println!("    {status}: {count}");
    }
    println!("  By kind:");
    for (kind, count) in &stats.by_kind {
        println!("    {kind}: {count}");
    }
    println!("  Artifact storage: {}", format_size(stats.artifact_bytes));
    let newest = stats.newest_backup.map(|t| format_timestamp(t.timestamp()));
    let oldest = stats.oldest_backup.map(|t| format_timestamp(t.timestamp()));
    println!("  Newest backup: {}", newest.unwrap_or_else(|| "-".to_string()));
    println!("  Oldest backup: {}", oldest.unwrap_or_else(|| "-".to_string()));
    Ok(())
}

fn show_history(
    vault: &BackupVault,
    backup: Option<BackupId>,
    format: OutputFormat,
) -> Result<(), anyhow::Error> {
    let events = vault.restore_history(backup)?;
    match format {
        OutputFormat::Json => print_json(&events)?,
        OutputFormat::Table if events.is_empty() => println!("No restores recorded"),
        OutputFormat::Table => {
            let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ScheduledReport {
    backup: BackupRecord,
    pruned: usize,
}

/// Retention only runs after a successful backup, so a broken dump never
/// erodes the existing history.
async fn scheduled_run(vault: &Arc<BackupVault>, format: OutputFormat) -> Result<(), anyhow::Error> {
    let backup = vault
        .spawn_create(BackupKind::Automatic, Some("scheduler".to_string()))
        .await?
        .map_err(|e| anyhow!(e.create_failure_message()))?;
    let pruned = vault.apply_retention()?;
    info!(backup_id = %backup.id, pruned, "scheduled run finished");

    match format {
        OutputFormat::Json => print_json(&ScheduledReport { backup, pruned })?,
        OutputFormat::Table => {
            println!("✓ Backup #{} created: {}", backup.id, backup.filename);
            println!("✓ Pruned {pruned} backup(s)");
        }
    }
    Ok(())
}

fn write_metrics(path: &Path) -> Result<(), anyhow::Error> {
    let Some(text) = observability::gather_metrics()? else {
        return Ok(());
    };
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}
