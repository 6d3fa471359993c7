/*!
Local filesystem artifact store.
*/

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::{NamedTempFile, TempDir};

use super::{ARTIFACTS_DIR, LOCK_FILE, PARTIAL_PREFIX, REGISTRY_FILE, STAGING_DIR, TMP_DIR};
use crate::record::{BackupId, BackupKind};
use crate::{Result, VaultError};

/// Local filesystem artifact store
///
/// Creates its directory layout on open. Artifacts are only ever made visible
/// at their final path by an atomic rename of a fully written temporary file.
///
/// # Example
/// ```rust
/// use divevault_core::storage::LocalArtifactStore;
///
/// let dir = tempfile::tempdir()?;
/// let store = LocalArtifactStore::open(dir.path())?;
/// assert!(store.artifacts_dir().is_dir());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Open (and create if needed) the store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        ensure_dir(root)?;
        let store = Self {
            root: fs::canonicalize(root).map_err(|e| storage_error("resolve root", root, e))?,
        };
        for dir in [store.artifacts_dir(), store.staging_dir(), store.tmp_dir()] {
            ensure_dir(&dir)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Resolve the artifact path for a bare filename
    pub fn artifact_path(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.artifacts_dir().join(filename))
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Size in bytes of the file at `path`
    pub fn file_len(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    /// Temporary file for a raw export; removed when dropped
    pub fn temp_export(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("export-")
            .suffix(".raw")
            .tempfile_in(self.tmp_dir())
            .map_err(|e| storage_error("create temporary export", &self.tmp_dir(), e))
    }

    /// Temporary file next to the final artifacts so the last step is a rename
    pub fn temp_artifact(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(self.artifacts_dir())
            .map_err(|e| storage_error("create partial artifact", &self.artifacts_dir(), e))
    }

    /// Isolated staging directory for one restore; removed when dropped
    pub fn staging_area(&self, target: BackupId) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!("restore-{target}-"))
            .tempdir_in(self.staging_dir())
            .map_err(|e| storage_error("create staging directory", &self.staging_dir(), e))
    }

    /// Atomically move a finished temporary artifact to `path`
    ///
    /// Refuses to overwrite an existing file.
    pub fn publish(&self, partial: NamedTempFile, path: &Path) -> Result<()> {
        self.ensure_inside_artifacts(path)?;
        partial
            .persist_noclobber(path)
            .map_err(|e| storage_error("publish artifact", path, e.error))?;
        sync_dir(&self.artifacts_dir());
        Ok(())
    }

    /// Remove an artifact; `Ok(false)` when it was already absent
    pub fn remove_artifact(&self, path: &Path) -> Result<bool> {
        self.ensure_inside_artifacts(path)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error("delete artifact", path, e)),
        }
    }

    fn ensure_inside_artifacts(&self, path: &Path) -> Result<()> {
        if path.parent() == Some(self.artifacts_dir().as_path()) {
            Ok(())
        } else {
            Err(VaultError::validation(format!(
                "{} is outside the artifacts directory",
                path.display()
            )))
        }
    }
}

/// Build an artifact filename: `<prefix>_<kind>_<YYYYMMDD_HHMMSS>_<suffix>.sql.<ext>`
pub fn artifact_filename(
    prefix: &str,
    kind: BackupKind,
    at: DateTime<Utc>,
    suffix: &str,
    extension: &str,
) -> String {
    format!(
        "{}_{}_{}_{}.sql.{}",
        prefix,
        kind,
        at.format("%Y%m%d_%H%M%S"),
        suffix,
        extension
    )
}

fn validate_filename(filename: &str) -> Result<()> {
    let invalid = filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(&['/', '\\'][..])
        || filename == "..";
    if invalid {
        return Err(VaultError::validation(format!(
            "invalid artifact filename: {filename:?}"
        )));
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| storage_error("create directory", path, e))
}

/// Best effort: make a rename durable on filesystems that need it.
#[cfg(unix)]
fn sync_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(path) {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) {}

fn storage_error(action: &str, path: &Path, e: io::Error) -> VaultError {
    VaultError::Io(io::Error::new(
        e.kind(),
        format!("failed to {action} at {}: {e}", path.display()),
    ))
}
