/*!
Collaborator ports to the live data store.

The engine never talks to the database directly. A [`DumpTool`] produces a raw
export, a [`RestoreTool`] applies one, and an optional [`LivenessProbe`]
confirms the store still answers after a restore.
*/

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ToolsConfig, VaultConfig};
use crate::VaultError;

pub mod command;
pub mod file;
pub(crate) mod process;

pub use command::{CommandDumpTool, CommandLivenessProbe, CommandRestoreTool};
pub use file::{FileCopyDumpTool, FileCopyRestoreTool, FileLivenessProbe};

/// Produces a full raw export of the live store
#[cfg_attr(test, mockall::automock)]
pub trait DumpTool: Send + Sync {
    /// Write the export to `dest`, which the caller has already created
    fn export(&self, dest: &Path, timeout: Duration) -> crate::Result<()>;
}

/// Why an apply attempt failed
#[derive(Debug)]
pub enum ApplyError {
    /// The live store was not touched; the tool never started mutating it
    NotStarted(VaultError),
    /// The tool started and may have left the store partially modified
    Interrupted(VaultError),
}

impl ApplyError {
    pub fn into_inner(self) -> VaultError {
        match self {
            Self::NotStarted(e) | Self::Interrupted(e) => e,
        }
    }

    pub fn touched_live_store(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

/// Applies a decompressed raw export onto the live store
#[cfg_attr(test, mockall::automock)]
pub trait RestoreTool: Send + Sync {
    fn apply(&self, staged: &Path, timeout: Duration) -> Result<(), ApplyError>;
}

/// Post-restore health check of the live store
#[cfg_attr(test, mockall::automock)]
pub trait LivenessProbe: Send + Sync {
    fn check(&self, timeout: Duration) -> crate::Result<()>;
}

/// The collaborators selected by [`ToolsConfig`]
#[derive(Clone)]
pub struct Collaborators {
    pub dump: Arc<dyn DumpTool>,
    pub restore: Arc<dyn RestoreTool>,
    pub probe: Option<Arc<dyn LivenessProbe>>,
}

impl Collaborators {
    pub fn from_config(config: &VaultConfig) -> Self {
        match &config.tools {
            ToolsConfig::Command {
                dump,
                restore,
                probe,
            } => Self {
                dump: Arc::new(CommandDumpTool::new(dump.clone())),
                restore: Arc::new(CommandRestoreTool::new(restore.clone())),
                probe: probe.clone().map(|spec| {
                    Arc::new(CommandLivenessProbe::new(spec)) as Arc<dyn LivenessProbe>
                }),
            },
            ToolsConfig::DatabaseFile { path } => Self {
                dump: Arc::new(FileCopyDumpTool::new(path)),
                restore: Arc::new(FileCopyRestoreTool::new(path)),
                probe: Some(Arc::new(FileLivenessProbe::new(path))),
            },
        }
    }
}
