/*!
Error types for the divevault core engine.
*/

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::record::{BackupId, BackupStatus};

/// Result type used throughout the divevault core.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors that can occur during backup, restore and retention operations.
///
/// Every variant except [`VaultError::Degraded`] leaves the live data store
/// untouched and may be retried by the caller.
#[derive(Error, Debug)]
pub enum VaultError {
    /// No backup record with this id exists in the registry
    #[error("backup #{0} not found")]
    NotFound(BackupId),

    /// The record exists but its artifact file is gone
    #[error("artifact for backup #{id} is missing at {}", .path.display())]
    ArtifactMissing { id: BackupId, path: PathBuf },

    /// The artifact on disk does not hash to the recorded checksum
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Another restore (or an operation on the same backup) holds the restore lock
    #[error("restore lock is held{}", holder_suffix(.holder))]
    Busy { holder: Option<BackupId> },

    /// An external dump/restore/probe process reported failure
    #[error("{tool} failed{}: {output}", exit_code_suffix(.code))]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    /// An external process exceeded its timeout and was killed
    #[error("{tool} timed out after {}s", .after.as_secs())]
    Timeout { tool: String, after: Duration },

    /// The pre-restore safety backup could not be taken
    #[error("pre-restore safety backup failed: {0}")]
    SafetyBackupFailed(#[source] Box<VaultError>),

    /// The target artifact could not be decompressed into staging
    #[error("staging failed: {0}")]
    StagingFailed(String),

    /// The restore failed after the live store may have been modified
    #[error("restore did not complete cleanly — recover from backup #{safety_backup_id}")]
    Degraded {
        target: BackupId,
        safety_backup_id: BackupId,
        #[source]
        source: Box<VaultError>,
    },

    /// The dump tool produced a zero-byte export
    #[error("dump tool produced an empty export")]
    EmptyExport,

    /// The record is not in a state that can serve as a restore source
    #[error("backup #{id} is {status} and cannot be restored")]
    NotRestorable { id: BackupId, status: BackupStatus },

    /// An illegal status transition was attempted on a record
    #[error("invalid status transition for backup #{id}: {from} -> {to}")]
    InvalidTransition {
        id: BackupId,
        from: BackupStatus,
        to: BackupStatus,
    },

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Metadata registry errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl VaultError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new registry error
    pub fn registry<S: Into<String>>(msg: S) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new staging error
    pub fn staging<S: Into<String>>(msg: S) -> Self {
        Self::StagingFailed(msg.into())
    }

    /// True when retrying the same call cannot make things worse.
    ///
    /// `Degraded` requires operator action; `InvalidTransition` and
    /// `Validation` indicate a caller or configuration bug.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Degraded { .. } | Self::InvalidTransition { .. } | Self::Validation(_)
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// The pre-restore backup to recover from, when the restore is degraded.
    pub fn safety_backup_id(&self) -> Option<BackupId> {
        match self {
            Self::Degraded {
                safety_backup_id, ..
            } => Some(*safety_backup_id),
            _ => None,
        }
    }

    /// Message shown to the user when a backup could not be created.
    pub fn create_failure_message(&self) -> String {
        format!("backup not created: {self}")
    }

    /// Message shown to the user when a restore did not finalize.
    pub fn restore_failure_message(&self) -> String {
        match self {
            Self::Degraded {
                safety_backup_id, ..
            } => format!(
                "restore did not complete cleanly — recover from backup #{safety_backup_id}"
            ),
            other => format!("restore aborted, no changes made: {other}"),
        }
    }
}

impl divevault_retry::RetryableError for VaultError {
    /// Only a held restore lock clears up on its own.
    fn is_transient(&self) -> bool {
        self.is_busy()
    }
}

fn holder_suffix(holder: &Option<BackupId>) -> String {
    holder
        .map(|id| format!(" by backup #{id}"))
        .unwrap_or_default()
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with exit code {c}"))
        .unwrap_or_default()
}
