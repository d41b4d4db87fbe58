//! SSH transport used to reach fixture containers.
//!
//! [`OpenSsh`] drives the system OpenSSH client. `connect` authenticates once
//! with the fixture password and leaves a multiplexing control master running;
//! `exec` and `upload` reuse its control socket so no further authentication
//! happens, and `close` asks the master to exit.

mod config;

use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::command::{CommandError, CommandOutput, CommandRunner};

pub use config::{SshConfig, SshConfigError};

/// Externally reachable address of a container's SSH daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SshEndpoint {
    /// Host address.
    pub address: IpAddr,
    /// Host port.
    pub port: u16,
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(addr) => write!(f, "{addr}:{}", self.port),
            IpAddr::V6(addr) => write!(f, "[{addr}]:{}", self.port),
        }
    }
}

/// Handle to an authenticated SSH connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSession {
    endpoint: SshEndpoint,
    user: String,
    control_path: Utf8PathBuf,
    closed: bool,
}

impl SshSession {
    /// Creates an open session handle.
    #[must_use]
    pub fn new(
        endpoint: SshEndpoint,
        user: impl Into<String>,
        control_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            endpoint,
            user: user.into(),
            control_path: control_path.into(),
            closed: false,
        }
    }

    /// Address the session is connected to.
    #[must_use]
    pub const fn endpoint(&self) -> SshEndpoint {
        self.endpoint
    }

    /// Remote user.
    #[must_use]
    pub const fn user(&self) -> &str {
        self.user.as_str()
    }

    /// Control socket multiplexing the connection.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    /// Returns `true` once the session has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the session closed.
    pub const fn mark_closed(&mut self) {
        self.closed = true;
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.endpoint.address)
    }
}

/// Output captured from a remote command executed over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code reported by the remote command, if the process exited
    /// normally.
    pub exit_code: Option<i32>,
    /// Captured standard output stream.
    pub stdout: String,
    /// Captured standard error stream.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the remote command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

impl From<CommandOutput> for RemoteCommandOutput {
    fn from(output: CommandOutput) -> Self {
        Self {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Errors surfaced while using an SSH session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when an SSH client process cannot be run.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the SSH client reports a failure.
    #[error("{program} {operation} to {endpoint} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Client program.
        program: String,
        /// Operation attempted (`connect`, `upload`, `close`).
        operation: String,
        /// Remote endpoint.
        endpoint: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the client.
        stderr: String,
    },
    /// Raised when a closed session is used.
    #[error("ssh session to {endpoint} is closed")]
    SessionClosed {
        /// Remote endpoint.
        endpoint: String,
    },
}

/// Operations the lifecycle needs from an SSH client.
pub trait SshTransport {
    /// Opens an authenticated session to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the connection or authentication fails.
    fn connect(&self, endpoint: SshEndpoint) -> Result<SshSession, SshError>;

    /// Runs `command` through the remote login shell.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the command cannot be run; a non-zero remote
    /// exit code is reported in the output, not as an error.
    fn exec(&self, session: &SshSession, command: &str) -> Result<RemoteCommandOutput, SshError>;

    /// Recursively copies `source` to `destination` on the remote host.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the copy fails.
    fn upload(
        &self,
        session: &SshSession,
        source: &Utf8Path,
        destination: &str,
    ) -> Result<(), SshError>;

    /// Closes the session. Closing an already closed session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the client reports a failure; the session is
    /// marked closed regardless.
    fn close(&self, session: &mut SshSession) -> Result<(), SshError>;
}

/// [`SshTransport`] backed by the system OpenSSH client and `sshpass`.
#[derive(Clone, Debug)]
pub struct OpenSsh<R: CommandRunner> {
    config: SshConfig,
    runner: R,
}

impl<R: CommandRunner> OpenSsh<R> {
    /// Creates a transport using `config` and `runner`.
    #[must_use]
    pub const fn new(config: SshConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Settings this transport was created with.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    fn host_key_options(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }
        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }
        args
    }

    fn multiplexed_options(&self, session: &SshSession) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", session.control_path)),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
        ];
        args.extend(self.host_key_options());
        args
    }

    fn connect_args(&self, endpoint: SshEndpoint, control_path: &Utf8Path) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(&self.config.password),
            OsString::from(&self.config.ssh_bin),
            OsString::from("-p"),
            OsString::from(endpoint.port.to_string()),
        ];
        args.extend(self.host_key_options());
        for option in [
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            format!("ConnectionAttempts={}", self.config.connection_attempts),
            String::from("ControlMaster=yes"),
            format!("ControlPath={control_path}"),
            String::from("ControlPersist=yes"),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from("-f"));
        args.push(OsString::from("-N"));
        args.push(OsString::from(format!(
            "{}@{}",
            self.config.user, endpoint.address
        )));
        args
    }

    fn check(
        &self,
        program: &str,
        operation: &str,
        endpoint: SshEndpoint,
        output: CommandOutput,
    ) -> Result<CommandOutput, SshError> {
        if output.is_success() {
            return Ok(output);
        }
        Err(SshError::CommandFailure {
            program: program.to_owned(),
            operation: operation.to_owned(),
            endpoint: endpoint.to_string(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    fn ensure_open(session: &SshSession) -> Result<(), SshError> {
        if session.is_closed() {
            return Err(SshError::SessionClosed {
                endpoint: session.endpoint.to_string(),
            });
        }
        Ok(())
    }
}

impl<R: CommandRunner> SshTransport for OpenSsh<R> {
    fn connect(&self, endpoint: SshEndpoint) -> Result<SshSession, SshError> {
        let control_path = Utf8PathBuf::from(&self.config.control_dir)
            .join(format!("berth-{}.sock", Uuid::new_v4().simple()));
        debug!(%endpoint, %control_path, "opening ssh control master");

        let args = self.connect_args(endpoint, &control_path);
        let output = self.runner.run(&self.config.password_bin, &args)?;
        self.check(&self.config.ssh_bin, "connect", endpoint, output)?;
        Ok(SshSession::new(endpoint, self.config.user.as_str(), control_path))
    }

    fn exec(&self, session: &SshSession, command: &str) -> Result<RemoteCommandOutput, SshError> {
        Self::ensure_open(session)?;
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(session.endpoint.port.to_string()),
        ];
        args.extend(self.multiplexed_options(session));
        args.push(OsString::from(session.destination()));
        args.push(OsString::from(command));

        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        Ok(output.into())
    }

    fn upload(
        &self,
        session: &SshSession,
        source: &Utf8Path,
        destination: &str,
    ) -> Result<(), SshError> {
        Self::ensure_open(session)?;
        let mut args = vec![
            OsString::from("-r"),
            OsString::from("-P"),
            OsString::from(session.endpoint.port.to_string()),
        ];
        args.extend(self.multiplexed_options(session));
        args.push(OsString::from(source.as_str()));
        let target = match session.endpoint.address {
            IpAddr::V4(addr) => format!("{}@{addr}:{destination}", session.user),
            IpAddr::V6(addr) => format!("{}@[{addr}]:{destination}", session.user),
        };
        args.push(OsString::from(target));

        let output = self.runner.run(&self.config.scp_bin, &args)?;
        self.check(&self.config.scp_bin, "upload", session.endpoint, output)
            .map(|_| ())
    }

    fn close(&self, session: &mut SshSession) -> Result<(), SshError> {
        if session.is_closed() {
            return Ok(());
        }
        session.mark_closed();
        debug!(endpoint = %session.endpoint, "closing ssh control master");

        let args = vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", session.control_path)),
            OsString::from("-O"),
            OsString::from("exit"),
            OsString::from(session.destination()),
        ];
        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        self.check(&self.config.ssh_bin, "close", session.endpoint, output)
            .map(|_| ())
    }
}
