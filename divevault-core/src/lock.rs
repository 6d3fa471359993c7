/*!
Single-flight guard for restores and other operations that must not overlap
with one.

Acquisition never waits: a held lock yields [`VaultError::Busy`] straight
away and the caller decides whether to retry. The in-process backend is only
sound when exactly one process serves a storage root; the file backend is
shared by every process that points at the same root.
*/

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::record::BackupId;
use crate::{Result, VaultError};

/// Mutual-exclusion port keyed by the backup the holder is working on
pub trait RestoreLock: Send + Sync {
    /// Take the lock for `holder` or fail with `Busy`
    fn try_acquire(&self, holder: BackupId) -> Result<()>;

    /// Release the lock if `holder` still owns it
    fn release(&self, holder: BackupId) -> Result<()>;

    /// The backup id of the current holder, if any
    fn current_holder(&self) -> Result<Option<BackupId>>;
}

/// Releases the lock when dropped, on every exit path
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RestoreLockGuard {
    lock: Arc<dyn RestoreLock>,
    holder: BackupId,
}

impl RestoreLockGuard {
    pub fn holder(&self) -> BackupId {
        self.holder
    }
}

impl Drop for RestoreLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.holder) {
            warn!(holder = %self.holder, error = %e, "failed to release restore lock");
        } else {
            debug!(holder = %self.holder, "restore lock released");
        }
    }
}

/// Acquire `lock` for `holder`, returning a guard that releases it
pub fn acquire(lock: &Arc<dyn RestoreLock>, holder: BackupId) -> Result<RestoreLockGuard> {
    lock.try_acquire(holder)?;
    debug!(holder = %holder, "restore lock acquired");
    Ok(RestoreLockGuard {
        lock: Arc::clone(lock),
        holder,
    })
}

/// Build the configured lock backend for a storage root
pub fn from_config(config: &LockConfig, lock_path: &Path) -> Arc<dyn RestoreLock> {
    match config {
        LockConfig::InProcess => Arc::new(InProcessRestoreLock::new()),
        LockConfig::File { stale_after_secs } => {
            let lock = FileRestoreLock::new(lock_path);
            Arc::new(match stale_after_secs {
                Some(secs) => lock.with_stale_after(Duration::from_secs(*secs)),
                None => lock,
            })
        }
    }
}

/// Mutex-backed lock for single-process deployments and tests
#[derive(Debug, Default)]
pub struct InProcessRestoreLock {
    holder: Mutex<Option<BackupId>>,
}

impl InProcessRestoreLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<BackupId>>> {
        self.holder
            .lock()
            .map_err(|_| VaultError::validation("restore lock mutex poisoned"))
    }
}

impl RestoreLock for InProcessRestoreLock {
    fn try_acquire(&self, holder: BackupId) -> Result<()> {
        let mut slot = self.slot()?;
        match *slot {
            Some(current) => Err(VaultError::Busy {
                holder: Some(current),
            }),
            None => {
                *slot = Some(holder);
                Ok(())
            }
        }
    }

    fn release(&self, holder: BackupId) -> Result<()> {
        let mut slot = self.slot()?;
        if *slot == Some(holder) {
            *slot = None;
        }
        Ok(())
    }

    fn current_holder(&self) -> Result<Option<BackupId>> {
        Ok(*self.slot()?)
    }
}

/// Contents of the lock file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct LockFileContents {
    holder: BackupId,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Lock file created with `O_EXCL` under the storage root
///
/// The file records which backup the holder is working on so a second
/// process can report it in its `Busy` error. A file older than
/// `stale_after` is assumed to belong to a crashed process and is broken.
#[derive(Debug, Clone)]
pub struct FileRestoreLock {
    path: PathBuf,
    stale_after: Option<Duration>,
}

impl FileRestoreLock {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_contents(&self) -> Result<Option<LockFileContents>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create(&self, holder: BackupId) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let contents = LockFileContents {
            holder,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&contents).map_err(io::Error::from)?;
        file.write_all(&body)?;
        file.sync_all()
    }
}

impl RestoreLock for FileRestoreLock {
    fn try_acquire(&self, holder: BackupId) -> Result<()> {
        match self.create(holder) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(stale_after) = self.stale_after {
                    let previous = self.read_contents()?;
                    if break_stale(&self.path, stale_after)? {
                        warn!(
                            path = %self.path.display(),
                            previous_holder = ?previous.map(|c| c.holder),
                            "broke stale restore lock"
                        );
                        // A racing process may win the re-create; it then owns the lock.
                        return match self.create(holder) {
                            Ok(()) => Ok(()),
                            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                                Err(VaultError::Busy {
                                    holder: self.read_contents()?.map(|c| c.holder),
                                })
                            }
                            Err(e) => Err(e.into()),
                        };
                    }
                }
                Err(VaultError::Busy {
                    holder: self.read_contents()?.map(|c| c.holder),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, holder: BackupId) -> Result<()> {
        match self.read_contents()? {
            Some(contents) if contents.holder == holder && contents.pid == std::process::id() => {
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(()),
        }
    }

    fn current_holder(&self) -> Result<Option<BackupId>> {
        Ok(self.read_contents()?.map(|c| c.holder))
    }
}

/// Identity of one lock file: its mtime and contents, read through one handle
#[derive(Debug, PartialEq)]
struct LockStamp {
    modified: SystemTime,
    body: Vec<u8>,
}

impl LockStamp {
    fn read(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let modified = file.metadata()?.modified()?;
        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        Ok(Self { modified, body })
    }

    fn older_than(&self, age: Duration) -> bool {
        self.modified
            .elapsed()
            .map_or(false, |elapsed| elapsed > age)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive right to break one lock file, held through `<lock>.break`
struct Breaker {
    path: PathBuf,
}

impl Breaker {
    fn try_claim(lock_path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        let path = sibling(lock_path, ".break");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Left behind by a process that died mid-break
                if LockStamp::read(&path).map_or(false, |stamp| stamp.older_than(stale_after)) {
                    let _ = fs::remove_file(&path);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Breaker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock breaker file");
        }
    }
}

/// Remove the lock file at `path` if it has not been written for `stale_after`
///
/// Breakers take turns through a `.break` file and re-check staleness once
/// they hold it, so a lock re-created by an earlier breaker is never removed.
/// The stale file is renamed to a unique tombstone and compared with what was
/// judged stale; a file replaced in between is linked back untouched.
///
/// # Returns
/// `true` when the stale file was removed and the caller may create the lock
pub(crate) fn break_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let Some(_breaker) = Breaker::try_claim(path, stale_after)? else {
        return Ok(false);
    };
    let observed = match LockStamp::read(path) {
        Ok(stamp) => stamp,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !observed.older_than(stale_after) {
        return Ok(false);
    }

    let tombstone = sibling(path, &format!(".stale-{}", Uuid::new_v4().simple()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    let broke = matches!(LockStamp::read(&tombstone), Ok(ref moved) if *moved == observed);
    if !broke {
        if let Err(e) = fs::hard_link(&tombstone, path) {
            warn!(path = %path.display(), error = %e, "could not reinstate replaced lock file");
        }
    }
    fs::remove_file(&tombstone)?;
    Ok(broke)
}
