/*!
Metadata registry: one record per backup plus the restore audit trail.

The registry is pure data access. It assigns ids, refuses reused filenames and
persists whatever state the engines hand it; it does not decide transitions.
*/

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lock;
use crate::record::{
    BackupId, BackupKind, BackupRecord, NewBackupRecord, NewRestoreEvent, RestoreEvent,
};
use crate::{Result, VaultError};

/// Storage port for backup metadata
pub trait MetadataRegistry: Send + Sync {
    /// Persist a new `pending` record under a fresh id
    ///
    /// Fails if the filename has ever been registered before, even if that
    /// record was later deleted.
    fn register_pending(&self, new: NewBackupRecord) -> Result<BackupRecord>;

    /// Get a single backup by id
    fn get(&self, id: BackupId) -> Result<Option<BackupRecord>>;

    /// List records, newest first, optionally restricted to one kind
    fn list(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>>;

    /// Replace the stored record with the same id
    fn update(&self, record: &BackupRecord) -> Result<()>;

    /// Whether `filename` was ever allocated
    fn filename_taken(&self, filename: &str) -> Result<bool>;

    /// Append a restore audit entry
    fn record_restore_event(&self, event: NewRestoreEvent) -> Result<RestoreEvent>;

    /// Restore audit entries, newest first, optionally for one target backup
    fn restore_events(&self, target: Option<BackupId>) -> Result<Vec<RestoreEvent>>;
}

/// On-disk shape of the flat index file
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct RegistryIndex {
    next_id: u64,
    next_event_id: u64,
    records: Vec<BackupRecord>,
    filenames: BTreeSet<String>,
    restore_events: Vec<RestoreEvent>,
}

impl RegistryIndex {
    fn register_pending(&mut self, new: NewBackupRecord) -> Result<BackupRecord> {
        if self.filenames.contains(&new.filename) {
            return Err(VaultError::registry(format!(
                "filename {} was already allocated",
                new.filename
            )));
        }
        self.next_id += 1;
        let record = new.into_pending(BackupId(self.next_id));
        self.filenames.insert(record.filename.clone());
        self.records.push(record.clone());
        Ok(record)
    }

    fn get(&self, id: BackupId) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn list(&self, kind: Option<BackupKind>) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self
            .records
            .iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect();
        newest_first(&mut records);
        records
    }

    fn update(&mut self, record: &BackupRecord) -> Result<()> {
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(VaultError::NotFound(record.id))?;
        if slot.filename != record.filename || slot.storage_path != record.storage_path {
            return Err(VaultError::registry(format!(
                "filename of backup #{} is immutable",
                record.id
            )));
        }
        *slot = record.clone();
        Ok(())
    }

    fn record_restore_event(&mut self, event: NewRestoreEvent) -> RestoreEvent {
        self.next_event_id += 1;
        let event = event.with_id(self.next_event_id);
        self.restore_events.push(event.clone());
        event
    }

    fn restore_events(&self, target: Option<BackupId>) -> Vec<RestoreEvent> {
        let mut events: Vec<RestoreEvent> = self
            .restore_events
            .iter()
            .filter(|e| target.map_or(true, |t| e.target == t))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        events
    }
}

/// Order by `created_at` descending, ties broken by id descending.
pub fn newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// Registry persisted as a single JSON index file
///
/// Every mutation is a read-modify-write of the whole index performed under
/// an in-process mutex and an exclusive `<index>.lock` file, so several
/// processes sharing a storage root serialize their writes. The new index is
/// written to a temporary file, fsynced and renamed over the old one; readers
/// never observe a torn file.
pub struct JsonFileRegistry {
    path: PathBuf,
    writer: Mutex<()>,
    lock_wait: Duration,
    lock_stale_after: Duration,
}

impl JsonFileRegistry {
    /// Open the registry at `path`, creating an empty index if none exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let registry = Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(()),
            lock_wait: Duration::from_secs(10),
            lock_stale_after: Duration::from_secs(120),
        };
        if !registry.path.exists() {
            registry.mutate(|_| Ok(()))?;
        }
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryIndex> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                VaultError::registry(format!("parse {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RegistryIndex::default()),
            Err(e) => Err(VaultError::registry(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, index: &RegistryIndex) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".registry-")
            .tempfile_in(dir)
            .map_err(|e| VaultError::registry(format!("create temporary index: {e}")))?;
        serde_json::to_writer_pretty(&mut tmp, index)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| VaultError::registry(format!("replace {}: {}", self.path.display(), e.error)))?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut RegistryIndex) -> Result<T>) -> Result<T> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| VaultError::registry("registry mutex poisoned"))?;
        let _file_lock = IndexFileLock::acquire(
            &lock_path_for(&self.path),
            self.lock_wait,
            self.lock_stale_after,
        )?;
        let mut index = self.load()?;
        let out = f(&mut index)?;
        self.save(&index)?;
        Ok(out)
    }
}

impl MetadataRegistry for JsonFileRegistry {
    fn register_pending(&self, new: NewBackupRecord) -> Result<BackupRecord> {
        self.mutate(|index| index.register_pending(new))
    }

    fn get(&self, id: BackupId) -> Result<Option<BackupRecord>> {
        Ok(self.load()?.get(id).cloned())
    }

    fn list(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        Ok(self.load()?.list(kind))
    }

    fn update(&self, record: &BackupRecord) -> Result<()> {
        self.mutate(|index| index.update(record))
    }

    fn filename_taken(&self, filename: &str) -> Result<bool> {
        Ok(self.load()?.filenames.contains(filename))
    }

    fn record_restore_event(&self, event: NewRestoreEvent) -> Result<RestoreEvent> {
        self.mutate(|index| Ok(index.record_restore_event(event)))
    }

    fn restore_events(&self, target: Option<BackupId>) -> Result<Vec<RestoreEvent>> {
        Ok(self.load()?.restore_events(target))
    }
}

fn lock_path_for(index: &Path) -> PathBuf {
    let mut name = index.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    index.with_file_name(name)
}

/// Exclusive lock file held for the duration of one index mutation
struct IndexFileLock {
    path: PathBuf,
}

impl IndexFileLock {
    fn acquire(path: &Path, wait: Duration, stale_after: Duration) -> Result<Self> {
        let deadline = SystemTime::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match lock::break_stale(path, stale_after) {
                        Ok(true) => {
                            warn!(path = %path.display(), "broke stale registry lock");
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "cannot break registry lock")
                        }
                    }
                    if SystemTime::now() >= deadline {
                        return Err(VaultError::registry(format!(
                            "timed out waiting for {}",
                            path.display()
                        )));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    return Err(VaultError::registry(format!(
                        "create {}: {e}",
                        path.display()
                    )))
                }
            }
        }
    }
}

impl Drop for IndexFileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release registry lock");
        }
    }
}

/// Registry held in memory, for ephemeral vaults and tests
///
/// Same id and filename rules as [`JsonFileRegistry`]; nothing survives the
/// process.
#[derive(Default)]
pub struct MemoryRegistry {
    index: Mutex<RegistryIndex>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_index<T>(&self, f: impl FnOnce(&mut RegistryIndex) -> Result<T>) -> Result<T> {
        let mut index = self
            .index
            .lock()
            .map_err(|_| VaultError::registry("registry mutex poisoned"))?;
        f(&mut index)
    }
}

impl MetadataRegistry for MemoryRegistry {
    fn register_pending(&self, new: NewBackupRecord) -> Result<BackupRecord> {
        self.with_index(|index| index.register_pending(new))
    }

    fn get(&self, id: BackupId) -> Result<Option<BackupRecord>> {
        self.with_index(|index| Ok(index.get(id).cloned()))
    }

    fn list(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        self.with_index(|index| Ok(index.list(kind)))
    }

    fn update(&self, record: &BackupRecord) -> Result<()> {
        self.with_index(|index| index.update(record))
    }

    fn filename_taken(&self, filename: &str) -> Result<bool> {
        self.with_index(|index| Ok(index.filenames.contains(filename)))
    }

    fn record_restore_event(&self, event: NewRestoreEvent) -> Result<RestoreEvent> {
        self.with_index(|index| Ok(index.record_restore_event(event)))
    }

    fn restore_events(&self, target: Option<BackupId>) -> Result<Vec<RestoreEvent>> {
        self.with_index(|index| Ok(index.restore_events(target)))
    }
}
