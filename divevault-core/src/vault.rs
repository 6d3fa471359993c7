/*!
`BackupVault`: the interface the rest of an application uses.

Wires the artifact store, registry, lock, collaborators and engines from a
[`VaultConfig`] and exposes backup, restore, listing and retention operations.
*/

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::info;

use crate::checksum::HashingWriter;
use crate::clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::compression::{copy_chunked, CompressionAdapter, GzipCompressor, CHUNK_SIZE};
use crate::config::VaultConfig;
use crate::lock::{self, RestoreLock};
use crate::record::{BackupId, BackupKind, BackupRecord, BackupStatus, RestoreEvent};
use crate::registry::{JsonFileRegistry, MetadataRegistry};
use crate::restore::{RestoreEngine, RestoreOutcome, RestoreSettings};
use crate::retention::RetentionManager;
use crate::snapshot::{SnapshotEngine, SnapshotSettings};
use crate::storage::LocalArtifactStore;
use crate::tools::Collaborators;
use crate::{Result, VaultError};

/// Aggregate figures over the registry
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct VaultStatistics {
    pub total_records: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    /// Sum of `size_bytes` over records that still have an artifact
    pub artifact_bytes: u64,
    pub newest_backup: Option<DateTime<Utc>>,
    pub oldest_backup: Option<DateTime<Utc>>,
}

/// Builder for [`BackupVault`] with replaceable collaborators
///
/// Anything not supplied is derived from the config.
pub struct VaultBuilder {
    config: VaultConfig,
    tools: Option<Collaborators>,
    lock: Option<Arc<dyn RestoreLock>>,
    registry: Option<Arc<dyn MetadataRegistry>>,
    compressor: Option<Arc<dyn CompressionAdapter>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl VaultBuilder {
    pub fn tools(mut self, tools: Collaborators) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn RestoreLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn CompressionAdapter>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Validate the config, create the storage layout and wire the engines
    pub fn build(self) -> Result<BackupVault> {
        let config = self.config;
        config.validate()?;

        let store = LocalArtifactStore::open(&config.storage_root)?;
        let registry: Arc<dyn MetadataRegistry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(JsonFileRegistry::open(store.registry_path())?),
        };
        let compressor = self
            .compressor
            .unwrap_or_else(|| Arc::new(GzipCompressor::with_level(config.compression_level)));
        let tools = self
            .tools
            .unwrap_or_else(|| Collaborators::from_config(&config));
        let lock = self
            .lock
            .unwrap_or_else(|| lock::from_config(&config.lock, &store.lock_path()));

        let snapshots = SnapshotEngine::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&compressor),
            tools.dump,
            Arc::clone(&self.clock),
            self.ids,
            SnapshotSettings {
                filename_prefix: config.filename_prefix.clone(),
                dump_timeout: config.dump_timeout(),
                allow_empty_export: config.allow_empty_export,
            },
        );
        let restores = RestoreEngine::new(
            store.clone(),
            Arc::clone(&registry),
            compressor,
            snapshots.clone(),
            tools.restore,
            tools.probe,
            Arc::clone(&lock),
            Arc::clone(&self.clock),
            RestoreSettings {
                restore_timeout: config.restore_timeout(),
                probe_timeout: config.probe_timeout(),
            },
        );
        let retention = RetentionManager::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&lock),
            self.clock,
        );

        info!(root = %store.root().display(), "backup vault opened");
        Ok(BackupVault {
            config,
            store,
            registry,
            snapshots,
            restores,
            retention,
        })
    }
}

/// Backup and restore facade over one storage root
///
/// # Example
/// ```rust,no_run
/// use divevault_core::{BackupKind, BackupVault, ToolsConfig, VaultConfig};
///
/// let config = VaultConfig::new(
///     "/var/backups/shop",
///     ToolsConfig::DatabaseFile { path: "/srv/shop/shop.db".into() },
/// );
/// let vault = BackupVault::from_config(config)?;
///
/// let backup = vault.create_backup(BackupKind::Manual, Some("alice"))?;
/// match vault.restore_backup(backup.id, Some("alice")) {
///     Ok(outcome) => println!("restored, safety backup #{}", outcome.safety_backup_id),
///     Err(e) => eprintln!("{}", e.restore_failure_message()),
/// }
/// # Ok::<(), divevault_core::VaultError>(())
/// ```
pub struct BackupVault {
    config: VaultConfig,
    store: LocalArtifactStore,
    registry: Arc<dyn MetadataRegistry>,
    snapshots: SnapshotEngine,
    restores: RestoreEngine,
    retention: RetentionManager,
}

impl BackupVault {
    pub fn builder(config: VaultConfig) -> VaultBuilder {
        VaultBuilder {
            config,
            tools: None,
            lock: None,
            registry: None,
            compressor: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
        }
    }

    /// Open a vault with every collaborator taken from `config`
    pub fn from_config(config: VaultConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalArtifactStore {
        &self.store
    }

    /// Take a backup of the live store
    pub fn create_backup(&self, kind: BackupKind, actor: Option<&str>) -> Result<BackupRecord> {
        self.snapshots.create(kind, actor)
    }

    /// Replace the live store with the contents of backup `id`
    pub fn restore_backup(&self, id: BackupId, actor: Option<&str>) -> Result<RestoreOutcome> {
        self.restores.restore(id, actor)
    }

    /// All records, newest first, optionally of one kind
    pub fn list_backups(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        self.registry.list(kind)
    }

    pub fn get_backup(&self, id: BackupId) -> Result<BackupRecord> {
        self.registry.get(id)?.ok_or(VaultError::NotFound(id))
    }

    /// Remove one backup's artifact, then mark it `deleted`
    pub fn delete_backup(&self, id: BackupId) -> Result<BackupRecord> {
        self.retention.delete(id)
    }

    /// Keep the newest `keep` backups of `kind`; returns how many were deleted
    pub fn prune(&self, kind: BackupKind, keep: usize) -> Result<usize> {
        self.retention.prune(kind, keep)
    }

    pub fn prune_older_than(
        &self,
        kind: Option<BackupKind>,
        max_age: ChronoDuration,
    ) -> Result<usize> {
        self.retention.prune_older_than(kind, max_age)
    }

    /// Apply the configured retention policy to every kind
    pub fn apply_retention(&self) -> Result<usize> {
        self.retention.apply_policy(&self.config.retention)
    }

    /// Recompute the checksum of backup `id` and compare it with the record
    pub fn verify_backup(&self, id: BackupId) -> Result<BackupRecord> {
        self.restores.verify(id)
    }

    /// Copy a verified artifact to `destination`
    ///
    /// The copy is written beside `destination`, checked against the stored
    /// checksum and then renamed into place. An existing file at
    /// `destination` is never overwritten.
    ///
    /// # Returns
    /// The number of bytes copied
    pub fn export_backup(&self, id: BackupId, destination: &Path) -> Result<u64> {
        let record = self.restores.verify(id)?;
        let expected = record.checksum.clone().unwrap_or_default();
        if destination.exists() {
            return Err(VaultError::validation(format!(
                "{} already exists",
                destination.display()
            )));
        }
        let dir = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let partial = tempfile::Builder::new()
            .prefix(".divevault-export-")
            .tempfile_in(dir)?;
        let mut src = File::open(&record.storage_path)?;
        let mut writer =
            HashingWriter::new(BufWriter::with_capacity(CHUNK_SIZE, partial.as_file()));
        let bytes = copy_chunked(&mut src, &mut writer)?;
        writer.flush()?;
        let (buffered, actual) = writer.finish();
        drop(buffered);
        if actual != expected {
            return Err(VaultError::ChecksumMismatch { expected, actual });
        }
        partial.as_file().sync_all()?;
        partial
            .persist_noclobber(destination)
            .map_err(|e| VaultError::Io(e.error))?;

        info!(backup_id = %id, destination = %destination.display(), bytes, "backup exported");
        Ok(bytes)
    }

    pub fn statistics(&self) -> Result<VaultStatistics> {
        let records = self.registry.list(None)?;
        let mut stats = VaultStatistics {
            total_records: records.len(),
            ..Default::default()
        };
        for record in &records {
            *stats
                .by_status
                .entry(record.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_kind
                .entry(record.kind.as_str().to_string())
                .or_default() += 1;
            if record.status.has_artifact() {
                stats.artifact_bytes += record.size_bytes.unwrap_or(0);
                stats.newest_backup = stats.newest_backup.max(Some(record.created_at));
                stats.oldest_backup = Some(
                    stats
                        .oldest_backup
                        .map_or(record.created_at, |t| t.min(record.created_at)),
                );
            }
        }
        Ok(stats)
    }

    /// Restore audit trail, newest first
    pub fn restore_history(&self, target: Option<BackupId>) -> Result<Vec<RestoreEvent>> {
        self.registry.restore_events(target)
    }

    /// Records with a usable artifact, newest first
    pub fn restorable_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self
            .registry
            .list(None)?
            .into_iter()
            .filter(|r| matches!(r.status, BackupStatus::Completed | BackupStatus::Restored))
            .collect())
    }
}

#[cfg(feature = "async-rt")]
impl BackupVault {
    /// Run [`BackupVault::create_backup`] on a blocking worker
    pub fn spawn_create(
        self: &Arc<Self>,
        kind: BackupKind,
        actor: Option<String>,
    ) -> tokio::task::JoinHandle<Result<BackupRecord>> {
        let vault = Arc::clone(self);
        tokio::task::spawn_blocking(move || vault.create_backup(kind, actor.as_deref()))
    }

    /// Run [`BackupVault::restore_backup`] on a blocking worker
    pub fn spawn_restore(
        self: &Arc<Self>,
        id: BackupId,
        actor: Option<String>,
    ) -> tokio::task::JoinHandle<Result<RestoreOutcome>> {
        let vault = Arc::clone(self);
        tokio::task::spawn_blocking(move || vault.restore_backup(id, actor.as_deref()))
    }
}
