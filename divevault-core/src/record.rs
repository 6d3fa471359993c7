/*!
Backup record schema and its status state machine.
*/

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, VaultError};

/// Registry-assigned identifier of a backup record. Never reused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct BackupId(pub u64);

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BackupId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim_start_matches('#')
            .parse::<u64>()
            .map(BackupId)
            .map_err(|_| VaultError::validation(format!("invalid backup id: {s}")))
    }
}

/// Why a backup was taken.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Automatic,
    PreRestore,
}

impl BackupKind {
    pub const ALL: [BackupKind; 3] = [Self::Manual, Self::Automatic, Self::PreRestore];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
            Self::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "automatic" => Ok(Self::Automatic),
            "pre_restore" | "pre-restore" => Ok(Self::PreRestore),
            other => Err(VaultError::validation(format!("unknown backup kind: {other}"))),
        }
    }
}

/// Lifecycle state of a backup record.
///
/// ```text
/// pending -> completed -> restored
///    |           |           |
///    v           +-----+-----+
/// failed               v
///    |              deleted
///    +-----------------^
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Completed,
    Failed,
    Restored,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Restored => "restored",
            Self::Deleted => "deleted",
        }
    }

    /// Completed and restored records have a verified artifact on disk.
    pub fn has_artifact(&self) -> bool {
        matches!(self, Self::Completed | Self::Restored)
    }

    fn can_transition_to(&self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        matches!(
            (*self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Completed, Restored)
                | (Restored, Restored)
                | (Completed, Deleted)
                | (Restored, Deleted)
                | (Failed, Deleted)
        )
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "restored" => Ok(Self::Restored),
            "deleted" => Ok(Self::Deleted),
            other => Err(VaultError::validation(format!("unknown backup status: {other}"))),
        }
    }
}

/// One record per snapshot attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub id: BackupId,

    /// Unique for the lifetime of the registry
    pub filename: String,

    /// Absolute artifact path derived from `filename`
    pub storage_path: PathBuf,

    pub kind: BackupKind,

    pub status: BackupStatus,

    /// Size of the compressed artifact, set on completion
    pub size_bytes: Option<u64>,

    /// SHA-256 of the compressed artifact, set on completion
    pub checksum: Option<String>,

    /// Triggering actor; `None` for automatic jobs
    pub created_by: Option<String>,

    pub created_at: DateTime<Utc>,

    pub restored_at: Option<DateTime<Utc>>,

    pub deleted_at: Option<DateTime<Utc>>,

    /// Set when status is `failed`
    pub error_message: Option<String>,
}

/// Fields supplied by the caller when registering a pending record.
#[derive(Debug, Clone)]
pub struct NewBackupRecord {
    pub filename: String,
    pub storage_path: PathBuf,
    pub kind: BackupKind,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewBackupRecord {
    /// Materialize the pending record under a registry-assigned id.
    pub fn into_pending(self, id: BackupId) -> BackupRecord {
        BackupRecord {
            id,
            filename: self.filename,
            storage_path: self.storage_path,
            kind: self.kind,
            status: BackupStatus::Pending,
            size_bytes: None,
            checksum: None,
            created_by: self.created_by,
            created_at: self.created_at,
            restored_at: None,
            deleted_at: None,
            error_message: None,
        }
    }
}

impl BackupRecord {
    fn transition(&mut self, next: BackupStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(VaultError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record a fully written and verified artifact.
    pub fn mark_completed<S: Into<String>>(&mut self, size_bytes: u64, checksum: S) -> Result<()> {
        let checksum = checksum.into();
        if checksum.is_empty() {
            return Err(VaultError::validation("checksum cannot be empty"));
        }
        self.transition(BackupStatus::Completed)?;
        self.size_bytes = Some(size_bytes);
        self.checksum = Some(checksum);
        Ok(())
    }

    pub fn mark_failed<S: Into<String>>(&mut self, error_message: S) -> Result<()> {
        self.transition(BackupStatus::Failed)?;
        self.error_message = Some(error_message.into());
        Ok(())
    }

    pub fn mark_restored(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(BackupStatus::Restored)?;
        self.restored_at = Some(at);
        Ok(())
    }

    /// The checksum is kept for audit after the artifact is removed.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(BackupStatus::Deleted)?;
        self.deleted_at = Some(at);
        Ok(())
    }

    /// Only verified records may be offered as a restore source.
    pub fn ensure_restorable(&self) -> Result<()> {
        if self.status.has_artifact() && self.checksum.is_some() {
            Ok(())
        } else {
            Err(VaultError::NotRestorable {
                id: self.id,
                status: self.status,
            })
        }
    }
}

/// Position of a restore in its state machine.
///
/// `Finalized`, `Aborted` and `Degraded` are terminal. `Aborted` guarantees
/// the live store was not touched; `Degraded` means it may have been.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Requested,
    Validated,
    SafetyBackupTaken,
    Staged,
    Applied,
    Finalized,
    Aborted,
    Degraded,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Validated => "validated",
            Self::SafetyBackupTaken => "safety_backup_taken",
            Self::Staged => "staged",
            Self::Applied => "applied",
            Self::Finalized => "finalized",
            Self::Aborted => "aborted",
            Self::Degraded => "degraded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Aborted | Self::Degraded)
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry for one restore attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RestoreEvent {
    pub id: u64,
    pub target: BackupId,
    pub safety_backup: Option<BackupId>,
    pub actor: Option<String>,
    pub state: RestoreState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Restore audit entry before the registry assigns its id.
#[derive(Debug, Clone)]
pub struct NewRestoreEvent {
    pub target: BackupId,
    pub safety_backup: Option<BackupId>,
    pub actor: Option<String>,
    pub state: RestoreState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl NewRestoreEvent {
    pub fn with_id(self, id: u64) -> RestoreEvent {
        RestoreEvent {
            id,
            target: self.target,
            safety_backup: self.safety_backup,
            actor: self.actor,
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_message: self.error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: u64) -> BackupRecord {
        NewBackupRecord {
            filename: format!("backup_manual_{id}.sql.gz"),
            storage_path: PathBuf::from(format!("/tmp/backup_manual_{id}.sql.gz")),
            kind: BackupKind::Manual,
            created_by: Some("alice".to_string()),
            created_at: Utc::now(),
        }
        .into_pending(BackupId(id))
    }

    #[test]
    fn test_pending_record_has_no_checksum() {
        let record = pending(1);
        assert_eq!(record.status, BackupStatus::Pending);
        assert!(record.checksum.is_none());
        assert!(record.size_bytes.is_none());
        assert!(record.ensure_restorable().is_err());
    }

    #[test]
    fn test_completed_then_restored_then_deleted() {
        let mut record = pending(1);
        record.mark_completed(42, "abc").unwrap();
        assert_eq!(record.size_bytes, Some(42));
        assert!(record.ensure_restorable().is_ok());

        let now = Utc::now();
        record.mark_restored(now).unwrap();
        assert_eq!(record.restored_at, Some(now));
        assert!(record.ensure_restorable().is_ok());

        record.mark_deleted(now).unwrap();
        assert_eq!(record.status, BackupStatus::Deleted);
        assert_eq!(record.checksum.as_deref(), Some("abc"));
        assert!(record.ensure_restorable().is_err());
    }

    #[test]
    fn test_failed_record_cannot_complete() {
        let mut record = pending(7);
        record.mark_failed("dump exited 1").unwrap();
        let err = record.mark_completed(1, "abc").unwrap_err();
        assert!(matches!(
            err,
            VaultError::InvalidTransition {
                from: BackupStatus::Failed,
                to: BackupStatus::Completed,
                ..
            }
        ));
        assert!(record.checksum.is_none());
    }

    #[test]
    fn test_pending_cannot_be_deleted_or_restored() {
        let mut record = pending(3);
        assert!(record.mark_deleted(Utc::now()).is_err());
        assert!(record.mark_restored(Utc::now()).is_err());
    }

    #[test]
    fn test_empty_checksum_rejected() {
        let mut record = pending(3);
        assert!(record.mark_completed(10, "").is_err());
        assert_eq!(record.status, BackupStatus::Pending);
    }

    #[test]
    fn test_kind_and_id_parsing() {
        assert_eq!("pre_restore".parse::<BackupKind>().unwrap(), BackupKind::PreRestore);
        assert_eq!("pre-restore".parse::<BackupKind>().unwrap(), BackupKind::PreRestore);
        assert!("weekly".parse::<BackupKind>().is_err());
        assert_eq!("#42".parse::<BackupId>().unwrap(), BackupId(42));
        assert!("forty-two".parse::<BackupId>().is_err());
    }
}
