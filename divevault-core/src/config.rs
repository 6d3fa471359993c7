//! Typed configuration for the backup engine
//!
//! Every operation receives its paths, timeouts and collaborator settings
//! through [`VaultConfig`]. Nothing is read from ambient process state except
//! where a caller explicitly resolves environment overrides before building
//! the config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::record::BackupKind;

/// Which [`crate::lock::RestoreLock`] implementation guards restores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum LockConfig {
    /// Mutex inside this process; only valid for a single-instance deployment
    InProcess,
    /// Exclusive lock file under the storage root, shared by every process
    /// that points at the same root
    File {
        /// Break a lock file older than this many seconds
        #[serde(default)]
        stale_after_secs: Option<u64>,
    },
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::File {
            stale_after_secs: None,
        }
    }
}

/// An external program invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment, typically database credentials
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Collaborator backend producing and applying raw exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum ToolsConfig {
    /// Dump/restore CLIs (e.g. `mysqldump` / `mysql`)
    Command {
        dump: CommandSpec,
        restore: CommandSpec,
        #[serde(default)]
        probe: Option<CommandSpec>,
    },
    /// A single embedded database file copied in and out
    DatabaseFile { path: PathBuf },
}

/// Keep-last-N counts per backup kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_manual: usize,
    pub keep_automatic: usize,
    pub keep_pre_restore: usize,
    /// Additionally expire anything older than this many days
    pub max_age_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_manual: 10,
            keep_automatic: 10,
            keep_pre_restore: 5,
            max_age_days: None,
        }
    }
}

impl RetentionConfig {
    pub fn keep_for(&self, kind: BackupKind) -> usize {
        match kind {
            BackupKind::Manual => self.keep_manual,
            BackupKind::Automatic => self.keep_automatic,
            BackupKind::PreRestore => self.keep_pre_restore,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Directory holding artifacts, staging, the registry and the lock file
    pub storage_root: PathBuf,
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
    /// Gzip level, 0-9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default = "default_tool_timeout_secs")]
    pub dump_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub restore_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Accept a zero-byte export as a valid backup of an empty store
    #[serde(default)]
    pub allow_empty_export: bool,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    pub tools: ToolsConfig,
}

fn default_filename_prefix() -> String {
    "backup".to_string()
}

fn default_compression_level() -> u32 {
    9
}

fn default_tool_timeout_secs() -> u64 {
    3600
}

fn default_probe_timeout_secs() -> u64 {
    30
}

impl VaultConfig {
    /// Configuration with defaults for everything except root and tools
    pub fn new<P: Into<PathBuf>>(storage_root: P, tools: ToolsConfig) -> Self {
        Self {
            storage_root: storage_root.into(),
            filename_prefix: default_filename_prefix(),
            compression_level: default_compression_level(),
            dump_timeout_secs: default_tool_timeout_secs(),
            restore_timeout_secs: default_tool_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            allow_empty_export: false,
            lock: LockConfig::default(),
            retention: RetentionConfig::default(),
            tools,
        }
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(crate::VaultError::validation("storage_root cannot be empty"));
        }
        if self.filename_prefix.is_empty()
            || !self
                .filename_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(crate::VaultError::validation(
                "filename_prefix must be non-empty and contain only [A-Za-z0-9_-]",
            ));
        }
        if self.compression_level > 9 {
            return Err(crate::VaultError::validation(
                "compression_level must be between 0 and 9",
            ));
        }
        if self.dump_timeout_secs == 0 || self.restore_timeout_secs == 0 || self.probe_timeout_secs == 0
        {
            return Err(crate::VaultError::validation("timeouts must be greater than zero"));
        }
        if let LockConfig::File {
            stale_after_secs: Some(0),
        } = self.lock
        {
            return Err(crate::VaultError::validation(
                "lock stale_after_secs must be greater than zero",
            ));
        }
        match &self.tools {
            ToolsConfig::Command { dump, restore, probe } => {
                let specs = [Some(dump), Some(restore), probe.as_ref()];
                if specs.into_iter().flatten().any(|spec| spec.program.is_empty()) {
                    return Err(crate::VaultError::validation(
                        "command program cannot be empty",
                    ));
                }
            }
            ToolsConfig::DatabaseFile { path } => {
                if path.as_os_str().is_empty() {
                    return Err(crate::VaultError::validation(
                        "database file path cannot be empty",
                    ));
                }
                if path.starts_with(&self.storage_root) {
                    return Err(crate::VaultError::validation(
                        "database file must live outside storage_root",
                    ));
                }
            }
        }
        Ok(())
    }
}
