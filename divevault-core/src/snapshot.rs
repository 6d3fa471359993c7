/*!
Snapshot engine: produces one verified, compressed artifact and its record.

This module contains the backup half of the core business logic. It
orchestrates the dump collaborator, the compressor, the artifact store and
the metadata registry, and guarantees that a failed attempt leaves no
artifact behind.
*/

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::checksum::{compute_file_checksum, HashingWriter};
use crate::clock::{Clock, IdGenerator};
use crate::compression::{CompressionAdapter, CHUNK_SIZE};
use crate::observability;
use crate::record::{BackupKind, BackupRecord, NewBackupRecord};
use crate::registry::MetadataRegistry;
use crate::storage::{local::artifact_filename, LocalArtifactStore};
use crate::tools::DumpTool;
use crate::{Result, VaultError};

/// How many fresh suffixes to try before giving up on a unique filename
const FILENAME_ATTEMPTS: usize = 8;

/// Tunables for backup creation
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub filename_prefix: String,
    pub dump_timeout: Duration,
    pub allow_empty_export: bool,
}

/// Engine for backup creation
///
/// Cheap to clone; every collaborator is shared. The restore engine holds a
/// clone to take its pre-restore safety backups.
///
/// # Example
/// ```rust,no_run
/// use divevault_core::{BackupKind, BackupVault, VaultConfig, ToolsConfig};
///
/// let config = VaultConfig::new(
///     "/var/backups/shop",
///     ToolsConfig::DatabaseFile { path: "/srv/shop/shop.db".into() },
/// );
/// let vault = BackupVault::from_config(config)?;
/// let record = vault.create_backup(BackupKind::Manual, Some("alice"))?;
/// println!("created {} ({} bytes)", record.filename, record.size_bytes.unwrap_or(0));
/// # Ok::<(), divevault_core::VaultError>(())
/// ```
#[derive(Clone)]
pub struct SnapshotEngine {
    store: LocalArtifactStore,
    registry: Arc<dyn MetadataRegistry>,
    compressor: Arc<dyn CompressionAdapter>,
    dump: Arc<dyn DumpTool>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: SnapshotSettings,
}

impl SnapshotEngine {
    pub fn new(
        store: LocalArtifactStore,
        registry: Arc<dyn MetadataRegistry>,
        compressor: Arc<dyn CompressionAdapter>,
        dump: Arc<dyn DumpTool>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        settings: SnapshotSettings,
    ) -> Self {
        Self {
            store,
            registry,
            compressor,
            dump,
            clock,
            ids,
            settings,
        }
    }

    /// Create one backup of the live store
    ///
    /// This method:
    /// 1. Allocates a filename never used before and registers a `pending` record
    /// 2. Runs the dump tool into a temporary raw export
    /// 3. Streams the export through the compressor into a partial artifact,
    ///    hashing the compressed bytes on the way
    /// 4. Re-reads the partial artifact from disk and checks the hash
    /// 5. Publishes the artifact with an atomic no-clobber rename
    /// 6. Marks the record `completed` with size and checksum
    ///
    /// The raw export and the partial artifact are temporaries that are
    /// removed on every exit path.
    ///
    /// # Errors
    /// Any step failure marks the record `failed` with the error message and
    /// returns the error. No file exists at the artifact path afterwards.
    #[instrument(skip_all, fields(kind = %kind, actor = ?actor))]
    pub fn create(&self, kind: BackupKind, actor: Option<&str>) -> Result<BackupRecord> {
        let started = Instant::now();
        let mut record = self.register(kind, actor)?;
        info!(backup_id = %record.id, filename = %record.filename, "backup started");

        let completed = self.produce_artifact(&record).and_then(|(size, checksum)| {
            let mut completed = record.clone();
            completed.mark_completed(size, checksum)?;
            self.registry.update(&completed)?;
            Ok(completed)
        });

        match completed {
            Ok(completed) => {
                let size = completed.size_bytes.unwrap_or(0);
                info!(
                    backup_id = %completed.id,
                    size_bytes = size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backup completed"
                );
                observability::record_backup(kind, true, started.elapsed(), Some(size));
                Ok(completed)
            }
            Err(e) => {
                warn!(backup_id = %record.id, error = %e, "backup failed");
                self.discard(&mut record, &e);
                observability::record_backup(kind, false, started.elapsed(), None);
                Err(e)
            }
        }
    }

    fn register(&self, kind: BackupKind, actor: Option<&str>) -> Result<BackupRecord> {
        let created_at = self.clock.now();
        for _ in 0..FILENAME_ATTEMPTS {
            let filename = artifact_filename(
                &self.settings.filename_prefix,
                kind,
                created_at,
                &self.ids.unique_suffix(),
                self.compressor.extension(),
            );
            let storage_path = self.store.artifact_path(&filename)?;
            if self.registry.filename_taken(&filename)? || self.store.exists(&storage_path) {
                debug!(filename = %filename, "filename collision, drawing a new suffix");
                continue;
            }
            let new = NewBackupRecord {
                filename,
                storage_path,
                kind,
                created_by: actor.map(str::to_string),
                created_at,
            };
            match self.registry.register_pending(new) {
                Ok(record) => return Ok(record),
                // Lost a race for the same name with another process
                Err(VaultError::Registry(msg)) if msg.contains("already allocated") => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VaultError::registry(format!(
            "could not allocate a unique filename after {FILENAME_ATTEMPTS} attempts"
        )))
    }

    /// Returns the compressed size and checksum of the published artifact.
    fn produce_artifact(&self, record: &BackupRecord) -> Result<(u64, String)> {
        let export = self.store.temp_export()?;
        self.dump
            .export(export.path(), self.settings.dump_timeout)?;

        let raw_len = export.as_file().metadata()?.len();
        if raw_len == 0 && !self.settings.allow_empty_export {
            return Err(VaultError::EmptyExport);
        }
        debug!(backup_id = %record.id, raw_bytes = raw_len, "export finished");

        let partial = self.store.temp_artifact()?;
        let mut src = File::open(export.path())?;
        let mut writer =
            HashingWriter::new(BufWriter::with_capacity(CHUNK_SIZE, partial.as_file()));
        self.compressor.compress(&mut src, &mut writer)?;
        writer.flush()?;
        let (buffered, checksum) = writer.finish();
        drop(buffered);
        partial.as_file().sync_all()?;

        let size = partial.as_file().metadata()?.len();
        let on_disk = compute_file_checksum(partial.path())?;
        if on_disk != checksum {
            return Err(VaultError::ChecksumMismatch {
                expected: checksum,
                actual: on_disk,
            });
        }

        self.store.publish(partial, &record.storage_path)?;
        Ok((size, checksum))
    }

    /// Remove any published artifact and persist the `failed` status.
    fn discard(&self, record: &mut BackupRecord, cause: &VaultError) {
        if let Err(e) = self.store.remove_artifact(&record.storage_path) {
            error!(backup_id = %record.id, error = %e, "failed to remove artifact of failed backup");
        }
        if let Err(e) = record
            .mark_failed(cause.to_string())
            .and_then(|()| self.registry.update(record))
        {
            error!(backup_id = %record.id, error = %e, "failed to mark backup as failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, UuidGenerator};
    use crate::compression::GzipCompressor;
    use crate::record::BackupStatus;
    use crate::registry::MemoryRegistry;
    use crate::tools::MockDumpTool;
    use std::fs;
    use std::io::Cursor;

    fn engine(root: &std::path::Path, dump: MockDumpTool, allow_empty: bool) -> SnapshotEngine {
        SnapshotEngine::new(
            LocalArtifactStore::open(root).unwrap(),
            Arc::new(MemoryRegistry::new()),
            Arc::new(GzipCompressor::new()),
            Arc::new(dump),
            Arc::new(SystemClock),
            Arc::new(UuidGenerator),
            SnapshotSettings {
                filename_prefix: "backup".to_string(),
                dump_timeout: Duration::from_secs(5),
                allow_empty_export: allow_empty,
            },
        )
    }

    fn dump_writing(payload: &'static [u8]) -> MockDumpTool {
        let mut dump = MockDumpTool::new();
        dump.expect_export()
            .returning(move |dest, _| Ok(fs::write(dest, payload)?));
        dump
    }

    #[test]
    fn test_create_completes_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), dump_writing(b"CREATE TABLE divers (id INT);"), false);

        let record = engine.create(BackupKind::Manual, Some("alice")).unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.created_by.as_deref(), Some("alice"));
        assert!(record.size_bytes.unwrap() > 0);
        assert_eq!(
            compute_file_checksum(&record.storage_path).unwrap(),
            record.checksum.clone().unwrap()
        );

        let mut restored = Vec::new();
        GzipCompressor::new()
            .decompress(
                &mut Cursor::new(fs::read(&record.storage_path).unwrap()),
                &mut restored,
            )
            .unwrap();
        assert_eq!(restored, b"CREATE TABLE divers (id INT);");
        assert_eq!(fs::read_dir(engine.store.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_dump_failure_marks_record_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut dump = MockDumpTool::new();
        dump.expect_export().returning(|_, _| {
            Err(VaultError::ExternalToolFailed {
                tool: "dump".to_string(),
                code: Some(1),
                output: "mysqldump: Got error: 1045: Access denied".to_string(),
            })
        });
        let engine = engine(dir.path(), dump, false);

        let err = engine.create(BackupKind::Automatic, None).unwrap_err();
        assert!(err.create_failure_message().starts_with("backup not created"));

        let records = engine.registry.list(None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("Access denied"));
        assert!(!records[0].storage_path.exists());
        assert_eq!(fs::read_dir(engine.store.artifacts_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(engine.store.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_export_rejected_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), dump_writing(b""), false);
        let err = engine.create(BackupKind::Manual, None).unwrap_err();
        assert!(matches!(err, VaultError::EmptyExport));
    }

    #[test]
    fn test_empty_export_allowed_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), dump_writing(b""), true);
        let record = engine.create(BackupKind::Manual, None).unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
    }

    #[test]
    fn test_filename_collision_draws_new_suffix() {
        struct Repeating(std::sync::Mutex<Vec<&'static str>>);
        impl IdGenerator for Repeating {
            fn unique_suffix(&self) -> String {
                self.0.lock().unwrap().pop().unwrap_or("ffffffffffff").to_string()
            }
        }
        struct Fixed;
        impl Clock for Fixed {
            fn now(&self) -> chrono::DateTime<chrono::Utc> {
                chrono::DateTime::parse_from_rfc3339("2025-11-09T19:09:58Z")
                    .unwrap()
                    .with_timezone(&chrono::Utc)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), dump_writing(b"data"), false);
        engine.clock = Arc::new(Fixed);
        engine.ids = Arc::new(Repeating(std::sync::Mutex::new(vec![
            "bbbbbbbbbbbb",
            "aaaaaaaaaaaa",
            "aaaaaaaaaaaa",
        ])));

        let first = engine.create(BackupKind::Manual, None).unwrap();
        let second = engine.create(BackupKind::Manual, None).unwrap();
        assert_eq!(first.filename, "backup_manual_20251109_190958_aaaaaaaaaaaa.sql.gz");
        assert_eq!(second.filename, "backup_manual_20251109_190958_bbbbbbbbbbbb.sql.gz");
    }
}
