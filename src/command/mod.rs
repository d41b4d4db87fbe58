//! Process execution seam shared by the runtime and SSH layers.
//!
//! Every external program (the container runtime CLI, `ssh`, `scp`) is
//! invoked through [`CommandRunner`] with arguments passed as individual argv
//! elements, never through a shell. [`ProcessCommandRunner`] supervises the
//! child on a small Tokio runtime, racing its exit against an optional
//! wall-clock timeout and a shared [`CancellationToken`], so a hung runtime
//! call or SSH handshake cannot stall a lifecycle phase forever.

use std::ffi::OsString;
use std::fs::File;
use std::future;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::Stdio;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::runtime::{Builder, Handle};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

pub use tokio_util::sync::CancellationToken;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status used in error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while spawning or supervising an external command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned or its output captured.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command outlives the configured timeout and is killed.
    #[error("{program} did not finish within {} seconds", .timeout.as_secs())]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Raised when the shared cancellation token fires while a command runs.
    #[error("{program} was cancelled")]
    Cancelled {
        /// Command that was killed.
        program: String,
    },
}

impl CommandError {
    /// Returns `true` when the runner killed the command rather than the
    /// command failing to start.
    #[must_use]
    pub const fn is_interruption(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started, or
    /// [`CommandError::Timeout`] / [`CommandError::Cancelled`] when the runner
    /// had to kill it.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Runs `program` with the contents of `input` connected to its stdin.
    ///
    /// # Errors
    ///
    /// Same as [`CommandRunner::run`], plus [`CommandError::Spawn`] when
    /// `input` cannot be opened.
    fn run_with_stdin(
        &self,
        program: &str,
        args: &[OsString],
        input: &Utf8Path,
    ) -> Result<CommandOutput, CommandError>;
}

/// Real command runner that spawns processes on the host.
///
/// Output is captured into anonymous temporary files rather than pipes so the
/// child can never block on a full pipe while the runner waits for exit.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner {
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl ProcessCommandRunner {
    /// Creates a runner without timeout or cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills commands that run longer than `timeout`. A zero duration
    /// disables the limit, as does one too large to schedule.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Kills running commands and refuses new ones once `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn execute(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&Utf8Path>,
    ) -> Result<CommandOutput, CommandError> {
        block_on(program, self.supervise(program, args, input))
    }

    async fn supervise(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&Utf8Path>,
    ) -> Result<CommandOutput, CommandError> {
        let spawn_error = |err: io::Error| spawn_failure(program, &err);
        let token = self.cancellation.clone().unwrap_or_default();
        if token.is_cancelled() {
            return Err(CommandError::Cancelled {
                program: program.to_owned(),
            });
        }

        let mut stdout = tempfile::tempfile().map_err(spawn_error)?;
        let mut stderr = tempfile::tempfile().map_err(spawn_error)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(stdout.try_clone().map_err(spawn_error)?)
            .stderr(stderr.try_clone().map_err(spawn_error)?)
            .kill_on_drop(true);
        match input {
            Some(path) => {
                command.stdin(File::open(path).map_err(spawn_error)?);
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        debug!(program, ?args, "exec");
        let mut child = command.spawn().map_err(spawn_error)?;

        let deadline = self
            .timeout
            .and_then(|limit| Instant::now().checked_add(limit));
        let expired = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        let status = tokio::select! {
            exit = child.wait() => exit.map_err(spawn_error)?,
            () = token.cancelled() => {
                debug!(program, "cancellation requested, killing child");
                kill(&mut child, program).await;
                return Err(CommandError::Cancelled {
                    program: program.to_owned(),
                });
            }
            () = expired => {
                debug!(program, "timeout elapsed, killing child");
                kill(&mut child, program).await;
                return Err(CommandError::Timeout {
                    program: program.to_owned(),
                    timeout: self.timeout.unwrap_or_default(),
                });
            }
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: read_captured(&mut stdout).map_err(spawn_error)?,
            stderr: read_captured(&mut stderr).map_err(spawn_error)?,
        })
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.execute(program, args, None)
    }

    fn run_with_stdin(
        &self,
        program: &str,
        args: &[OsString],
        input: &Utf8Path,
    ) -> Result<CommandOutput, CommandError> {
        self.execute(program, args, Some(input))
    }
}

/// Drives `task` on a current-thread runtime, moved to a scoped thread when
/// the caller is already inside a Tokio runtime.
fn block_on<T: Send>(
    program: &str,
    task: impl Future<Output = Result<T, CommandError>> + Send,
) -> Result<T, CommandError> {
    let drive = || -> Result<T, CommandError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| spawn_failure(program, &err))?;
        runtime.block_on(task)
    };

    if Handle::try_current().is_err() {
        return drive();
    }
    thread::scope(|scope| scope.spawn(drive).join()).unwrap_or_else(|_| {
        Err(CommandError::Spawn {
            program: program.to_owned(),
            message: String::from("supervisor thread panicked"),
        })
    })
}

fn spawn_failure(program: &str, err: &io::Error) -> CommandError {
    CommandError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

/// Records a single invocation made through a scripted runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// File connected to stdin, when any.
    pub stdin: Option<Utf8PathBuf>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

async fn kill(child: &mut Child, program: &str) {
    if let Err(err) = child.kill().await {
        debug!(program, error = %err, "failed to kill child");
    }
}

fn read_captured(file: &mut File) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
