/*!
Embedded single-file database backend (e.g. SQLite).

The export is a byte copy of the database file. Restoring writes the staged
copy next to the live file and renames it into place, so the live file is
either the old or the new content, never a mix.
*/

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::info;

use super::{ApplyError, DumpTool, LivenessProbe, RestoreTool};
use crate::compression::CHUNK_SIZE;
use crate::{Result, VaultError};

/// Stream `src` into `dst`, failing with `Timeout` once the deadline passes
fn copy_with_deadline(
    tool: &str,
    src: &mut impl Read,
    dst: &mut impl Write,
    timeout: Duration,
) -> Result<u64> {
    let deadline = Instant::now() + timeout;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        if Instant::now() >= deadline {
            return Err(VaultError::Timeout {
                tool: tool.to_string(),
                after: timeout,
            });
        }
        let n = match src.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        dst.write_all(&buffer[..n])?;
        total += n as u64;
    }
    dst.flush()?;
    Ok(total)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

#[derive(Debug, Clone)]
pub struct FileCopyDumpTool {
    database: PathBuf,
}

impl FileCopyDumpTool {
    pub fn new<P: AsRef<Path>>(database: P) -> Self {
        Self {
            database: database.as_ref().to_path_buf(),
        }
    }
}

impl DumpTool for FileCopyDumpTool {
    fn export(&self, dest: &Path, timeout: Duration) -> Result<()> {
        let mut src = File::open(&self.database).map_err(|e| VaultError::ExternalToolFailed {
            tool: "dump".to_string(),
            code: None,
            output: format!("cannot open {}: {e}", self.database.display()),
        })?;
        let mut out = File::create(dest)?;
        let copied = copy_with_deadline("dump", &mut src, &mut out, timeout)?;
        out.sync_all()?;
        info!(database = %self.database.display(), bytes = copied, "database file exported");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileCopyRestoreTool {
    database: PathBuf,
}

impl FileCopyRestoreTool {
    pub fn new<P: AsRef<Path>>(database: P) -> Self {
        Self {
            database: database.as_ref().to_path_buf(),
        }
    }
}

impl RestoreTool for FileCopyRestoreTool {
    fn apply(&self, staged: &Path, timeout: Duration) -> std::result::Result<(), ApplyError> {
        let not_started = |e: VaultError| ApplyError::NotStarted(e);

        let mut src = File::open(staged).map_err(|e| not_started(e.into()))?;
        let mut incoming = tempfile::Builder::new()
            .prefix(".divevault-restore-")
            .tempfile_in(parent_dir(&self.database))
            .map_err(|e| not_started(e.into()))?;
        copy_with_deadline("restore", &mut src, incoming.as_file_mut(), timeout)
            .map_err(not_started)?;
        incoming
            .as_file()
            .sync_all()
            .map_err(|e| not_started(e.into()))?;

        incoming.persist(&self.database).map_err(|e| {
            ApplyError::Interrupted(VaultError::ExternalToolFailed {
                tool: "restore".to_string(),
                code: None,
                output: format!("cannot replace {}: {}", self.database.display(), e.error),
            })
        })?;
        info!(database = %self.database.display(), "database file replaced");
        Ok(())
    }
}

/// Checks that the database file exists and is readable
#[derive(Debug, Clone)]
pub struct FileLivenessProbe {
    database: PathBuf,
}

impl FileLivenessProbe {
    pub fn new<P: AsRef<Path>>(database: P) -> Self {
        Self {
            database: database.as_ref().to_path_buf(),
        }
    }
}

impl LivenessProbe for FileLivenessProbe {
    fn check(&self, _timeout: Duration) -> Result<()> {
        let probe_error = |output: String| VaultError::ExternalToolFailed {
            tool: "liveness probe".to_string(),
            code: None,
            output,
        };
        let metadata = fs::metadata(&self.database)
            .map_err(|e| probe_error(format!("{}: {e}", self.database.display())))?;
        if !metadata.is_file() {
            return Err(probe_error(format!(
                "{} is not a regular file",
                self.database.display()
            )));
        }
        let mut header = [0u8; 1];
        File::open(&self.database)
            .and_then(|mut f| f.read(&mut header))
            .map_err(|e| probe_error(format!("{}: {e}", self.database.display())))?;
        Ok(())
    }
}
