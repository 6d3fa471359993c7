/*!
Retention: keep-last-N and age-based pruning, plus single-record deletes.

Deletes remove the artifact first and update the record last. Each delete
holds the restore lock for the record it removes, only for the duration of
that one delete, so a restore can never read an artifact a prune is removing.
While a restore runs, prune skips its candidates and leaves them for the next
run. Backup creation never takes the lock.
*/

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::lock::{self, RestoreLock};
use crate::observability;
use crate::record::{BackupId, BackupKind, BackupRecord};
use crate::registry::MetadataRegistry;
use crate::storage::LocalArtifactStore;
use crate::{Result, VaultError};

pub struct RetentionManager {
    store: LocalArtifactStore,
    registry: Arc<dyn MetadataRegistry>,
    lock: Arc<dyn RestoreLock>,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(
        store: LocalArtifactStore,
        registry: Arc<dyn MetadataRegistry>,
        lock: Arc<dyn RestoreLock>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            lock,
            clock,
        }
    }

    /// Delete every `completed`/`restored` backup of `kind` beyond the newest `keep`
    ///
    /// Per-record failures are logged and skipped.
    ///
    /// # Returns
    /// The number of records actually deleted
    #[instrument(skip(self), fields(kind = %kind))]
    pub fn prune(&self, kind: BackupKind, keep: usize) -> Result<usize> {
        let candidates: Vec<BackupRecord> = self
            .registry
            .list(Some(kind))?
            .into_iter()
            .filter(|r| r.status.has_artifact())
            .skip(keep)
            .collect();
        let deleted = self.delete_batch(&candidates);
        info!(keep, candidates = candidates.len(), deleted, "prune finished");
        Ok(deleted)
    }

    /// Delete every `completed`/`restored` backup older than `max_age`
    #[instrument(skip(self))]
    pub fn prune_older_than(
        &self,
        kind: Option<BackupKind>,
        max_age: ChronoDuration,
    ) -> Result<usize> {
        let cutoff = self.clock.now() - max_age;
        let candidates: Vec<BackupRecord> = self
            .registry
            .list(kind)?
            .into_iter()
            .filter(|r| r.status.has_artifact() && r.created_at < cutoff)
            .collect();
        let deleted = self.delete_batch(&candidates);
        info!(cutoff = %cutoff, candidates = candidates.len(), deleted, "age-based prune finished");
        Ok(deleted)
    }

    /// Apply the configured keep counts to every kind, then the age limit if set
    pub fn apply_policy(&self, policy: &RetentionConfig) -> Result<usize> {
        let mut deleted = 0;
        for kind in BackupKind::ALL {
            deleted += self.prune(kind, policy.keep_for(kind))?;
        }
        if let Some(days) = policy.max_age_days {
            deleted += self.prune_older_than(None, ChronoDuration::days(i64::from(days)))?;
        }
        Ok(deleted)
    }

    /// Delete one backup on request
    ///
    /// # Errors
    /// * `NotFound` - No such record
    /// * `Busy` - A restore or another delete holds the restore lock
    /// * `InvalidTransition` - The record is pending or already deleted
    #[instrument(skip(self))]
    pub fn delete(&self, id: BackupId) -> Result<BackupRecord> {
        let deleted = self.delete_record(id)?;
        info!(backup_id = %id, "backup deleted");
        Ok(deleted)
    }

    fn delete_batch(&self, candidates: &[BackupRecord]) -> usize {
        let mut deleted = 0;
        for record in candidates {
            match self.delete_record(record.id) {
                Ok(_) => {
                    observability::record_pruned(record.kind, 1);
                    deleted += 1;
                }
                Err(e) if e.is_busy() => {
                    debug!(backup_id = %record.id, error = %e, "restore lock held, skipping");
                }
                Err(e) => warn!(backup_id = %record.id, error = %e, "failed to delete backup, skipping"),
            }
        }
        deleted
    }

    /// Artifact first, metadata last, all under the restore lock.
    ///
    /// The record is re-read once the lock is held; the listing that chose it
    /// may predate a restore that has since finished.
    fn delete_record(&self, id: BackupId) -> Result<BackupRecord> {
        let _guard = lock::acquire(&self.lock, id)?;
        let record = self.registry.get(id)?.ok_or(VaultError::NotFound(id))?;
        let mut deleted = record.clone();
        deleted.mark_deleted(self.clock.now())?;
        let removed = self.store.remove_artifact(&record.storage_path)?;
        if !removed {
            debug!(backup_id = %id, "artifact already absent");
        }
        self.registry.update(&deleted)?;
        Ok(deleted)
    }
}
