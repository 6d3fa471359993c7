/*!
Restore engine: the state machine that replaces the live store with the
contents of a backup.

```text
Requested -> Validated -> SafetyBackupTaken -> Staged -> Applied -> Finalized
    |            |               |                |          |
    +------------+---------------+----------------+          +--> Degraded
                              Aborted
```

Everything up to and including `Staged` happens without touching the live
store, so a failure there is `Aborted`. Once the restore tool has started, a
failure is `Degraded` and carries the id of the pre-restore safety backup.
*/

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::checksum::verify_file_checksum;
use crate::clock::Clock;
use crate::compression::{CompressionAdapter, CHUNK_SIZE};
use crate::lock::{self, RestoreLock};
use crate::observability;
use crate::record::{BackupId, BackupKind, BackupRecord, NewRestoreEvent, RestoreState};
use crate::registry::MetadataRegistry;
use crate::snapshot::SnapshotEngine;
use crate::storage::LocalArtifactStore;
use crate::tools::{ApplyError, LivenessProbe, RestoreTool};
use crate::{Result, VaultError};

/// Name of the decompressed export inside a staging directory
const STAGED_FILENAME: &str = "restore.sql";

/// Result of a restore that reached `Finalized`
///
/// Failed restores are returned as errors: [`VaultError::Degraded`] when the
/// live store may have changed, any other variant when it did not.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub target: BackupId,
    pub state: RestoreState,
    /// The `pre_restore` backup taken immediately before the restore was applied
    pub safety_backup_id: BackupId,
    pub restored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub restore_timeout: Duration,
    pub probe_timeout: Duration,
}

/// Where an attempt got to, for logging and the audit trail
#[derive(Debug)]
struct Progress {
    target: BackupId,
    state: RestoreState,
    safety_backup: Option<BackupId>,
}

impl Progress {
    fn advance(&mut self, state: RestoreState) {
        self.state = state;
        info!(backup_id = %self.target, state = %state, "restore advanced");
    }
}

/// Engine for restores and artifact verification
pub struct RestoreEngine {
    store: LocalArtifactStore,
    registry: Arc<dyn MetadataRegistry>,
    compressor: Arc<dyn CompressionAdapter>,
    snapshots: SnapshotEngine,
    restore_tool: Arc<dyn RestoreTool>,
    probe: Option<Arc<dyn LivenessProbe>>,
    lock: Arc<dyn RestoreLock>,
    clock: Arc<dyn Clock>,
    settings: RestoreSettings,
}

impl RestoreEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: LocalArtifactStore,
        registry: Arc<dyn MetadataRegistry>,
        compressor: Arc<dyn CompressionAdapter>,
        snapshots: SnapshotEngine,
        restore_tool: Arc<dyn RestoreTool>,
        probe: Option<Arc<dyn LivenessProbe>>,
        lock: Arc<dyn RestoreLock>,
        clock: Arc<dyn Clock>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            store,
            registry,
            compressor,
            snapshots,
            restore_tool,
            probe,
            lock,
            clock,
            settings,
        }
    }

    /// Check that backup `id` is restorable and its artifact is intact
    ///
    /// The same check a restore performs before taking its safety backup,
    /// without taking the lock.
    ///
    /// # Errors
    /// * `NotFound` - No such record
    /// * `NotRestorable` - The record is pending, failed or deleted
    /// * `ArtifactMissing` - The artifact file is gone
    /// * `ChecksumMismatch` - The artifact no longer hashes to the stored checksum
    pub fn verify(&self, id: BackupId) -> Result<BackupRecord> {
        let record = self.registry.get(id)?.ok_or(VaultError::NotFound(id))?;
        record.ensure_restorable()?;
        if !self.store.exists(&record.storage_path) {
            return Err(VaultError::ArtifactMissing {
                id,
                path: record.storage_path.clone(),
            });
        }
        let expected = record
            .checksum
            .as_deref()
            .ok_or(VaultError::NotRestorable {
                id,
                status: record.status,
            })?;
        verify_file_checksum(&record.storage_path, expected)?;
        Ok(record)
    }

    /// Restore the live store from backup `id`
    ///
    /// Every attempt that finds its target record is written to the restore
    /// audit trail with its terminal state, whether it succeeds or not.
    ///
    /// # Errors
    /// * `NotFound`, `NotRestorable`, `ArtifactMissing`, `ChecksumMismatch` - Validation failed
    /// * `Busy` - Another restore or conflicting operation holds the lock
    /// * `SafetyBackupFailed` - The pre-restore backup could not be taken
    /// * `StagingFailed` - The artifact could not be decompressed
    /// * `ExternalToolFailed` / `Timeout` - The restore tool could not be started
    /// * `Degraded` - The live store may have been modified; recover from the safety backup
    #[instrument(skip_all, fields(backup_id = %id, actor = ?actor))]
    pub fn restore(&self, id: BackupId, actor: Option<&str>) -> Result<RestoreOutcome> {
        let started_at = self.clock.now();
        let timer = Instant::now();
        if self.registry.get(id)?.is_none() {
            return Err(VaultError::NotFound(id));
        }

        let mut progress = Progress {
            target: id,
            state: RestoreState::Requested,
            safety_backup: None,
        };
        let result = self.run(&mut progress, actor);

        let (state, outcome_label) = match &result {
            Ok(_) => (RestoreState::Finalized, "finalized"),
            Err(e) if e.is_degraded() => (RestoreState::Degraded, "degraded"),
            Err(e) if e.is_busy() => (RestoreState::Aborted, "busy"),
            Err(_) => (RestoreState::Aborted, "aborted"),
        };
        match &result {
            Ok(_) => info!(state = %state, "restore finalized"),
            Err(e) if e.is_degraded() => {
                error!(state = %state, from_state = %progress.state, error = %e, "restore degraded")
            }
            Err(e) => warn!(state = %state, from_state = %progress.state, error = %e, "restore aborted"),
        }

        let event = NewRestoreEvent {
            target: id,
            safety_backup: progress.safety_backup,
            actor: actor.map(str::to_string),
            state,
            started_at,
            finished_at: self.clock.now(),
            error_message: result.as_ref().err().map(|e| match e {
                VaultError::Degraded { source, .. } => source.to_string(),
                other => other.to_string(),
            }),
        };
        if let Err(e) = self.registry.record_restore_event(event) {
            error!(error = %e, "failed to write restore audit entry");
        }
        observability::record_restore(outcome_label, timer.elapsed());

        result
    }

    fn run(&self, progress: &mut Progress, actor: Option<&str>) -> Result<RestoreOutcome> {
        let id = progress.target;

        // Requested -> Validated. The lock is taken first so nothing can
        // delete or prune the target between validation and staging.
        let _guard = lock::acquire(&self.lock, id)?;
        let target = self.verify(id)?;
        progress.advance(RestoreState::Validated);

        // Validated -> SafetyBackupTaken
        let safety = self
            .snapshots
            .create(BackupKind::PreRestore, actor)
            .map_err(|e| VaultError::SafetyBackupFailed(Box::new(e)))?;
        progress.safety_backup = Some(safety.id);
        progress.advance(RestoreState::SafetyBackupTaken);

        // SafetyBackupTaken -> Staged
        let staging = self
            .store
            .staging_area(id)
            .map_err(|e| VaultError::staging(e.to_string()))?;
        let staged = staging.path().join(STAGED_FILENAME);
        self.stage(&target, &staged)
            .map_err(|e| VaultError::staging(e.to_string()))?;
        progress.advance(RestoreState::Staged);

        // Staged -> Applied
        let degraded = |source: VaultError| VaultError::Degraded {
            target: id,
            safety_backup_id: safety.id,
            source: Box::new(source),
        };
        match self.restore_tool.apply(&staged, self.settings.restore_timeout) {
            Ok(()) => progress.advance(RestoreState::Applied),
            Err(ApplyError::NotStarted(e)) => return Err(e),
            Err(ApplyError::Interrupted(e)) => return Err(degraded(e)),
        }

        // Applied -> Finalized
        if let Some(probe) = &self.probe {
            probe.check(self.settings.probe_timeout).map_err(degraded)?;
        }
        let restored_at = self.clock.now();
        let mut restored = target;
        restored.mark_restored(restored_at).map_err(degraded)?;
        self.registry.update(&restored).map_err(degraded)?;
        drop(staging);
        progress.advance(RestoreState::Finalized);

        Ok(RestoreOutcome {
            target: id,
            state: RestoreState::Finalized,
            safety_backup_id: safety.id,
            restored_at,
        })
    }

    /// Decompress the target artifact into `staged`.
    fn stage(&self, target: &BackupRecord, staged: &Path) -> Result<()> {
        let mut src = File::open(&target.storage_path)?;
        let out = File::create(staged)?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, &out);
        let bytes = self.compressor.decompress(&mut src, &mut writer)?;
        writer.flush()?;
        drop(writer);
        out.sync_all()?;
        info!(backup_id = %target.id, staged_bytes = bytes, "artifact staged");
        Ok(())
    }
}
