//! The command-runner seam.
//!
//! The builder talks to subprocesses only through [`CommandRunner`], so tests
//! and remote execution can substitute their own. The shipped [`LocalRunner`]
//! spawns through the configured shell and enforces timeouts as SIGTERM,
//! a 10 ms grace period, then SIGKILL.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// How long a SIGTERM'd process gets before the SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(10);
/// Polling interval while waiting on a child.
const WAIT_INTERVAL: Duration = Duration::from_millis(5);

/// One command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Shell command text.
    pub command: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables, on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Hard wall-clock limit.
    pub timeout: Duration,
    /// Run under the configured sandbox wrapper.
    pub sandbox: bool,
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Everything the command wrote to stdout.
    pub stdout: Vec<u8>,
    /// Everything the command wrote to stderr.
    pub stderr: Vec<u8>,
}

/// Why a command did not succeed.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be spawned or awaited.
    #[error("failed to run command: {0}")]
    Io(#[from] std::io::Error),
    /// The process exited non-zero.
    #[error("command exited with status {code}")]
    NonZero {
        /// Exit code (-1 if killed by a signal).
        code: i32,
        /// Captured stdout.
        stdout: Vec<u8>,
        /// Captured stderr.
        stderr: Vec<u8>,
    },
    /// The process overran its timeout and was killed.
    #[error("Timeout exceeded")]
    Timeout {
        /// Stdout accumulated before the kill.
        stdout: Vec<u8>,
        /// Stderr accumulated before the kill.
        stderr: Vec<u8>,
    },
}

impl ExecError {
    /// Captured stderr, whatever the failure mode.
    #[must_use]
    pub fn stderr(&self) -> &[u8] {
        match self {
            Self::Io(_) => &[],
            Self::NonZero { stderr, .. } | Self::Timeout { stderr, .. } => stderr,
        }
    }

    /// Captured stdout, whatever the failure mode.
    #[must_use]
    pub fn stdout(&self) -> &[u8] {
        match self {
            Self::Io(_) => &[],
            Self::NonZero { stdout, .. } | Self::Timeout { stdout, .. } => stdout,
        }
    }
}

/// Spawns build and test commands.
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion, enforcing its timeout.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Runs commands as local subprocesses through a shell.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    /// Shell binary; commands run as `shell -c <command>`.
    pub shell: String,
    /// Wrapper command prepended for sandboxed targets.
    pub sandbox_tool: Option<String>,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_owned(),
            sandbox_tool: None,
        }
    }
}

impl LocalRunner {
    /// Creates a runner from configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            shell: config.build.shell.clone(),
            sandbox_tool: config.build.sandbox_tool.clone(),
        }
    }
}

impl CommandRunner for LocalRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let command_text = match (&self.sandbox_tool, spec.sandbox) {
            (Some(tool), true) => format!("{tool} {}", spec.command),
            _ => spec.command.clone(),
        };
        debug!(command = %command_text, cwd = %spec.cwd.display(), "running command");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command_text)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // A fresh process group so a timeout kill reaches the whole tree,
        // not just the shell.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        let mut child = cmd.spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + spec.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                let stdout = stdout.join().unwrap_or_default();
                let stderr = stderr.join().unwrap_or_default();
                if status.success() {
                    return Ok(CommandOutput { stdout, stderr });
                }
                return Err(ExecError::NonZero {
                    code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                });
            }
            if Instant::now() >= deadline {
                terminate(&mut child);
                let _ = child.wait();
                return Err(ExecError::Timeout {
                    stdout: stdout.join().unwrap_or_default(),
                    stderr: stderr.join().unwrap_or_default(),
                });
            }
            thread::sleep(WAIT_INTERVAL);
        }
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// SIGTERM, short grace, then SIGKILL, delivered to the whole process group.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let group = Pid::from_raw(-(child.id() as i32));
    let _ = kill(group, Signal::SIGTERM);
    thread::sleep(KILL_GRACE);
    if matches!(child.try_wait(), Ok(None)) {
        let _ = kill(group, Signal::SIGKILL);
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: command.to_owned(),
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            timeout,
            sandbox: false,
        }
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let runner = LocalRunner::default();
        let out = runner
            .run(&spec("echo out; echo err >&2", Duration::from_secs(10)))
            .unwrap();
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
    }

    #[test]
    fn env_vars_reach_the_command() {
        let runner = LocalRunner::default();
        let mut s = spec("printf '%s' \"$PLZ_TEST_VAR\"", Duration::from_secs(10));
        s.env.push(("PLZ_TEST_VAR".into(), "hello".into()));
        let out = runner.run(&s).unwrap();
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn nonzero_exit_reports_code_and_output() {
        let runner = LocalRunner::default();
        let err = runner
            .run(&spec("echo oops >&2; exit 3", Duration::from_secs(10)))
            .unwrap_err();
        match err {
            ExecError::NonZero { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, b"oops\n");
            }
            other => panic!("expected NonZero, got {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_and_reports() {
        let runner = LocalRunner::default();
        let start = Instant::now();
        let err = runner
            .run(&spec(
                "echo started >&2; sleep 30",
                Duration::from_millis(200),
            ))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10), "kill was not prompt");
        match err {
            ExecError::Timeout { ref stderr, .. } => {
                assert_eq!(stderr, b"started\n");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(err.to_string().contains("Timeout exceeded"));
    }
}
