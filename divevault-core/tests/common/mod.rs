//! Shared fixtures for the integration tests: a file-backed stand-in for the
//! live data store and fake collaborators that can be told to misbehave.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use divevault_core::{
    ApplyError, BackupVault, Clock, Collaborators, DumpTool, LivenessProbe, LockConfig,
    RestoreTool, Result, ToolsConfig, VaultConfig, VaultError,
};
use tempfile::TempDir;

/// Clock that advances one second every time it is read.
pub struct SteppingClock {
    now: Mutex<DateTime<Utc>>,
}

impl SteppingClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2025, 11, 9, 19, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::seconds(1);
        *now
    }
}

/// Clock stuck at a single instant, so filenames differ only by suffix.
pub struct FrozenClock(pub DateTime<Utc>);

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Dump tool that copies the live file, or fails like a real dump program
pub struct FakeDump {
    live: PathBuf,
    failure: Mutex<Option<(i32, String)>>,
}

impl FakeDump {
    pub fn fail_with(&self, code: i32, output: &str) {
        *self.failure.lock().unwrap() = Some((code, output.to_string()));
    }
}

impl DumpTool for FakeDump {
    fn export(&self, dest: &Path, _timeout: Duration) -> Result<()> {
        if let Some((code, output)) = self.failure.lock().unwrap().clone() {
            // Real dump programs leave partial output behind
            fs::write(dest, b"-- partial dump")?;
            return Err(VaultError::ExternalToolFailed {
                tool: "dump".to_string(),
                code: Some(code),
                output,
            });
        }
        fs::copy(&self.live, dest)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestoreMode {
    Apply,
    FailToStart,
    /// Leave the live file half written, then fail
    FailMidway,
    /// Report success but leave the live file empty
    ApplyThenCrash,
}

/// Restore tool that overwrites the live file with the staged export
pub struct FakeRestore {
    live: PathBuf,
    clock: Arc<SteppingClock>,
    mode: Mutex<RestoreMode>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub applied: Mutex<Vec<DateTime<Utc>>>,
}

impl FakeRestore {
    pub fn set_mode(&self, mode: RestoreMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

impl RestoreTool for FakeRestore {
    fn apply(&self, staged: &Path, _timeout: Duration) -> std::result::Result<(), ApplyError> {
        let mode = *self.mode.lock().unwrap();
        if mode == RestoreMode::FailToStart {
            return Err(ApplyError::NotStarted(VaultError::ExternalToolFailed {
                tool: "restore".to_string(),
                code: None,
                output: "No such file or directory".to_string(),
            }));
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        thread::sleep(*self.delay.lock().unwrap());

        let result = match mode {
            RestoreMode::FailMidway => {
                let _ = fs::write(&self.live, b"INSERT INTO dives VALUES (1, 'Bl");
                Err(ApplyError::Interrupted(VaultError::ExternalToolFailed {
                    tool: "restore".to_string(),
                    code: Some(1),
                    output: "ERROR 2013 (HY000): Lost connection".to_string(),
                }))
            }
            RestoreMode::ApplyThenCrash => fs::write(&self.live, b"")
                .map(|_| self.applied.lock().unwrap().push(self.clock.now()))
                .map_err(|e| ApplyError::Interrupted(e.into())),
            _ => fs::copy(staged, &self.live)
                .map(|_| self.applied.lock().unwrap().push(self.clock.now()))
                .map_err(|e| ApplyError::Interrupted(e.into())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Probe that reports the store down when the live file is empty
pub struct FakeProbe {
    live: PathBuf,
}

impl LivenessProbe for FakeProbe {
    fn check(&self, _timeout: Duration) -> Result<()> {
        if fs::metadata(&self.live)?.len() == 0 {
            return Err(VaultError::ExternalToolFailed {
                tool: "probe".to_string(),
                code: Some(1),
                output: "store is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A vault over a temp directory with a fake live store
pub struct Harness {
    pub dir: TempDir,
    pub live: PathBuf,
    pub clock: Arc<SteppingClock>,
    pub dump: Arc<FakeDump>,
    pub restore: Arc<FakeRestore>,
    pub vault: Arc<BackupVault>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live").join("shop.sql");
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&live, b"INSERT INTO dives VALUES (1, 'Blue Hole');\n").unwrap();

        let clock = Arc::new(SteppingClock::new());
        let dump = Arc::new(FakeDump {
            live: live.clone(),
            failure: Mutex::new(None),
        });
        let restore = Arc::new(FakeRestore {
            live: live.clone(),
            clock: Arc::clone(&clock),
            mode: Mutex::new(RestoreMode::Apply),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        });

        let vault = Arc::new(Self::build_vault(&dir, &live, &clock, &dump, &restore));
        Self {
            dir,
            live,
            clock,
            dump,
            restore,
            vault,
        }
    }

    /// A second vault over the same storage root, as another process would see it
    pub fn second_vault(&self) -> BackupVault {
        Self::build_vault(&self.dir, &self.live, &self.clock, &self.dump, &self.restore)
    }

    fn build_vault(
        dir: &TempDir,
        live: &Path,
        clock: &Arc<SteppingClock>,
        dump: &Arc<FakeDump>,
        restore: &Arc<FakeRestore>,
    ) -> BackupVault {
        let mut config = VaultConfig::new(
            dir.path().join("vault"),
            ToolsConfig::DatabaseFile {
                path: live.to_path_buf(),
            },
        );
        config.lock = LockConfig::File {
            stale_after_secs: None,
        };
        BackupVault::builder(config)
            .tools(Collaborators {
                dump: Arc::clone(dump) as Arc<dyn DumpTool>,
                restore: Arc::clone(restore) as Arc<dyn RestoreTool>,
                probe: Some(Arc::new(FakeProbe {
                    live: live.to_path_buf(),
                })),
            })
            .clock(Arc::clone(clock) as Arc<dyn Clock>)
            .build()
            .unwrap()
    }

    pub fn write_live(&self, contents: &str) {
        fs::write(&self.live, contents).unwrap();
    }

    pub fn live_contents(&self) -> Vec<u8> {
        fs::read(&self.live).unwrap()
    }

    pub fn artifacts(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.vault.store().artifacts_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
