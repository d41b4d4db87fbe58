//! SSH client settings loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::buildspec::{DEFAULT_ROOT_PASSWORD, SshBootstrap};

/// SSH settings for reaching fixture containers.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH_SSH",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `sshpass` executable used for password authentication.
    #[ortho_config(default = "sshpass".to_owned())]
    pub password_bin: String,
    /// Remote user; fixture images only prepare `root`.
    #[ortho_config(default = "root".to_owned())]
    pub user: String,
    /// Well-known fixture password baked into every image.
    #[ortho_config(default = DEFAULT_ROOT_PASSWORD.to_owned())]
    pub password: String,
    /// Whether to enforce host key checking; fixtures regenerate host keys on
    /// every build, so this defaults to off.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds allowed for the TCP connect and handshake.
    #[ortho_config(default = 30)]
    pub connect_timeout_secs: u64,
    /// Connection attempts before the master connection gives up.
    #[ortho_config(default = 3)]
    pub connection_attempts: u32,
    /// Wall-clock limit for each SSH or SCP process; 0 disables it.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
    /// Directory holding control sockets.
    #[ortho_config(default = "/tmp".to_owned())]
    pub control_dir: String,
}

/// Errors raised when SSH settings are unusable.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshConfigError {
    /// Raised when a required value is blank.
    #[error(
        "missing {field}: set BERTH_SSH_{env_suffix} or add {field} to berth.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the loader fails to merge sources.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Loads configuration using defaults, configuration files, and
    /// environment variables, ignoring the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("berth")])
            .map_err(|err| SshConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::InvalidConfig`] naming the first blank field.
    pub fn validate(&self) -> Result<(), SshConfigError> {
        for (value, field) in [
            (&self.ssh_bin, "ssh_bin"),
            (&self.scp_bin, "scp_bin"),
            (&self.password_bin, "password_bin"),
            (&self.user, "user"),
            (&self.password, "password"),
            (&self.control_dir, "control_dir"),
        ] {
            if value.trim().is_empty() {
                return Err(SshConfigError::InvalidConfig {
                    field: field.to_owned(),
                });
            }
        }
        if self.connection_attempts == 0 {
            return Err(SshConfigError::InvalidConfig {
                field: String::from("connection_attempts"),
            });
        }
        Ok(())
    }

    /// Image bootstrap whose root password matches the one used to connect.
    #[must_use]
    pub fn bootstrap(&self) -> SshBootstrap {
        SshBootstrap::new(self.password.as_str())
    }
}

