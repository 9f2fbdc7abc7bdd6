//! Remote shell collaborator used by the built-in collectors.
//!
//! [`SshShell`] runs non-interactive `ssh` commands (`BatchMode=yes`, stdin
//! closed) and kills the child process when its deadline passes.

use crate::error::{OrchestratorError, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured output of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (`None` when killed by a signal).
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands on a remote host.
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `host` and capture its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be started or did not finish
    /// within `timeout`.
    fn run(
        &self,
        host: &str,
        port: Option<u16>,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// [`RemoteShell`] backed by the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshShell {
    connect_timeout_secs: u32,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
        }
    }
}

impl SshShell {
    /// Create a shell with the default 5 second connect timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the argument vector passed to `ssh`.
    pub fn build_args(&self, host: &str, port: Option<u16>, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(port) = port {
            args.push("-p".to_owned());
            args.push(port.to_string());
        }
        args.push(host.to_owned());
        args.push(command.to_owned());
        args
    }
}

impl RemoteShell for SshShell {
    fn run(
        &self,
        host: &str,
        port: Option<u16>,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let ssh = which::which("ssh")
            .map_err(|e| OrchestratorError::Shell(format!("ssh not found: {e}")))?;

        let mut cmd = Command::new(ssh);
        cmd.args(self.build_args(host, port, command));
        run_with_timeout(cmd, timeout)
    }
}

/// Spawn `cmd` with piped output and wait at most `timeout` for it.
///
/// The child is killed when the deadline passes.
pub(crate) fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OrchestratorError::Shell(format!("cannot spawn command: {e}")))?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                kill_quietly(&mut child);
                return Err(OrchestratorError::Shell(format!(
                    "command timed out after {}ms",
                    timeout.as_millis()
                )));
            }
            None => std::thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
    })
}

fn spawn_reader<R>(pipe: Option<R>) -> std::thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = Vec::new();
            if pipe.read_to_end(&mut bytes).is_ok() {
                buf = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
        buf
    })
}

fn kill_quietly(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("failed to kill timed-out child: {e}");
    }
    let _ = child.wait();
}

/// Strip the `user@` prefix from an ssh target for display.
pub fn short_host(host: &str) -> &str {
    host.rsplit_once('@').map_or(host, |(_, h)| h)
}
