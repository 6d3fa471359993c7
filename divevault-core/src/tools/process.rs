/*!
Child process runner with a hard deadline.
*/

use std::fs::File;
use std::io::Read;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::CommandSpec;
use crate::VaultError;

/// Keep at most this much of a tool's stderr for error reports
const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Failure of a supervised child process
#[derive(Debug)]
pub(crate) enum RunError {
    /// The program could not be started at all
    Spawn(VaultError),
    /// The program ran and failed, or was killed at the deadline
    Run(VaultError),
}

impl RunError {
    pub(crate) fn into_inner(self) -> VaultError {
        match self {
            Self::Spawn(e) | Self::Run(e) => e,
        }
    }
}

/// Run `spec` to completion, killing it once `timeout` elapses
///
/// `stdin` and `stdout` default to the null device. Stderr is captured and
/// attached to the error when the program exits non-zero.
pub(crate) fn run(
    tool: &str,
    spec: &CommandSpec,
    stdin: Option<File>,
    stdout: Option<File>,
    timeout: Duration,
) -> Result<(), RunError> {
    let mut command = command_for(spec);
    command
        .stdin(stdin.map_or_else(Stdio::null, Stdio::from))
        .stdout(stdout.map_or_else(Stdio::null, Stdio::from));

    debug!(tool, program = %spec.program, args = ?spec.args, "spawning external tool");
    let mut child = command.spawn().map_err(|e| {
        RunError::Spawn(VaultError::ExternalToolFailed {
            tool: tool.to_string(),
            code: None,
            output: format!("failed to start {}: {e}", spec.program),
        })
    })?;

    let stderr = drain_stderr(&mut child);
    match wait_with_deadline(&mut child, timeout) {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(RunError::Run(VaultError::ExternalToolFailed {
            tool: tool.to_string(),
            code: status.code(),
            output: stderr
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default(),
        })),
        // A tool that left the process group may still hold the stderr pipe.
        None => {
            warn!(tool, timeout_secs = timeout.as_secs(), "external tool timed out and was killed");
            Err(RunError::Run(VaultError::Timeout {
                tool: tool.to_string(),
                after: timeout,
            }))
        }
    }
}

/// Command for `spec` with stderr piped, leading its own process group on unix
fn command_for(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stderr(Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// `None` means the deadline passed and the child was killed.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() >= deadline => break,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "failed to poll external tool");
                break;
            }
        }
    }
    kill_tree(child);
    let _ = child.wait();
    None
}

/// Kill the child and everything it spawned into its process group
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created at spawn and
    // its leader has not been reaped yet, so the id cannot have been reused.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut pipe = child.stderr.take()?;
    Some(thread::spawn(move || {
        let mut raw = Vec::new();
        let _ = pipe.read_to_end(&mut raw);
        if raw.len() > MAX_DIAGNOSTIC_BYTES {
            raw.drain(..raw.len() - MAX_DIAGNOSTIC_BYTES);
        }
        String::from_utf8_lossy(&raw).trim().to_string()
    }))
}
