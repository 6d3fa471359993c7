/*!
External dump/restore programs such as `mysqldump` and `mysql`.

The dump program writes the export to stdout; the restore program reads the
staged export on stdin. Credentials belong in [`CommandSpec::env`] so they
never appear in the process argument list.
*/

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use super::process::{self, RunError};
use super::{ApplyError, DumpTool, LivenessProbe, RestoreTool};
use crate::config::CommandSpec;
use crate::{Result, VaultError};

#[derive(Debug, Clone)]
pub struct CommandDumpTool {
    spec: CommandSpec,
}

impl CommandDumpTool {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl DumpTool for CommandDumpTool {
    fn export(&self, dest: &Path, timeout: Duration) -> Result<()> {
        let out = File::create(dest)?;
        process::run("dump", &self.spec, None, Some(out), timeout).map_err(RunError::into_inner)?;
        info!(program = %self.spec.program, dest = %dest.display(), "dump tool finished");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandRestoreTool {
    spec: CommandSpec,
}

impl CommandRestoreTool {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl RestoreTool for CommandRestoreTool {
    fn apply(&self, staged: &Path, timeout: Duration) -> std::result::Result<(), ApplyError> {
        let input = File::open(staged)
            .map_err(|e| ApplyError::NotStarted(VaultError::Io(e)))?;
        match process::run("restore", &self.spec, Some(input), None, timeout) {
            Ok(()) => Ok(()),
            Err(RunError::Spawn(e)) => Err(ApplyError::NotStarted(e)),
            Err(RunError::Run(e)) => Err(ApplyError::Interrupted(e)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandLivenessProbe {
    spec: CommandSpec,
}

impl CommandLivenessProbe {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl LivenessProbe for CommandLivenessProbe {
    fn check(&self, timeout: Duration) -> Result<()> {
        process::run("liveness probe", &self.spec, None, None, timeout)
            .map_err(RunError::into_inner)
    }
}
