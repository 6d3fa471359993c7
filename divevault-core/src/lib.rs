/*!
# Divevault Core Engine

Backup and restore engine for a single live data store.

This crate takes compressed, checksummed backups of a data store through an
external dump tool, keeps a metadata registry of every attempt, restores a
chosen backup through a safety-first state machine, and prunes old backups:

- Every restore takes a fresh `pre_restore` backup before touching live data
- A failed backup never leaves a partial artifact behind
- Restores are single-flight, guarded by a lock shared across processes
- Artifacts are streamed through gzip in bounded memory

## Architecture

The engines depend only on ports:
- [`DumpTool`], [`RestoreTool`] and [`LivenessProbe`] talk to the live store
- [`MetadataRegistry`] persists records, [`RestoreLock`] guards restores
- [`CompressionAdapter`] compresses artifacts, [`Clock`] and [`IdGenerator`]
  supply timestamps and filename suffixes

[`BackupVault`] wires the default implementations from a [`VaultConfig`].

## Usage

```rust,no_run
use divevault_core::{BackupKind, BackupVault, CommandSpec, ToolsConfig, VaultConfig};

let tools = ToolsConfig::Command {
    dump: CommandSpec::new("mysqldump").arg("--single-transaction").arg("shop"),
    restore: CommandSpec::new("mysql").arg("shop"),
    probe: Some(CommandSpec::new("mysqladmin").arg("ping")),
};
let vault = BackupVault::from_config(VaultConfig::new("/var/backups/shop", tools))?;

let backup = vault.create_backup(BackupKind::Manual, Some("alice"))?;
vault.prune(BackupKind::Automatic, 10)?;
let outcome = vault.restore_backup(backup.id, Some("alice"))?;
println!("restored; safety backup is #{}", outcome.safety_backup_id);
# Ok::<(), divevault_core::VaultError>(())
```
*/

pub mod checksum;
pub mod clock;
pub mod compression;
pub mod config;
pub mod error;
pub mod lock;
pub mod observability;
pub mod record;
pub mod registry;
pub mod restore;
pub mod retention;
pub mod snapshot;
pub mod storage;
pub mod tools;
pub mod vault;

#[cfg(test)]
mod error_tests;

pub use clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{CommandSpec, LockConfig, RetentionConfig, ToolsConfig, VaultConfig};
pub use error::{Result, VaultError};
pub use lock::{FileRestoreLock, InProcessRestoreLock, RestoreLock, RestoreLockGuard};
pub use record::{
    BackupId, BackupKind, BackupRecord, BackupStatus, RestoreEvent, RestoreState,
};
pub use registry::{JsonFileRegistry, MemoryRegistry, MetadataRegistry};
pub use restore::{RestoreEngine, RestoreOutcome};
pub use retention::RetentionManager;
pub use snapshot::SnapshotEngine;
pub use storage::LocalArtifactStore;
pub use tools::{ApplyError, Collaborators, DumpTool, LivenessProbe, RestoreTool};
pub use vault::{BackupVault, VaultBuilder, VaultStatistics};
