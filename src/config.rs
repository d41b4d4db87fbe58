//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `berth.toml` discovered through the usual search
//! order, and `BERTH_*` environment variables. Enumerated settings are kept as
//! strings in the layered structs and parsed by `validate` so that a typo is
//! reported with the variable and key that set it.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::runtime::DEFAULT_DOCKER_BIN;

/// Lifecycle policy settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct LifecycleConfig {
    /// Destroy policy: remove containers, images and build artifacts on
    /// teardown. Disable to keep them for post-mortem debugging.
    #[ortho_config(default = true)]
    pub destroy: bool,
    /// Prefix for generated image names.
    #[ortho_config(default = "berth".to_owned())]
    pub image_prefix: String,
    /// Directory receiving `buildfile-<image>` artifacts.
    #[ortho_config(default = ".".to_owned())]
    pub work_dir: String,
    /// `fail-fast` or `isolated`.
    #[ortho_config(default = "fail-fast".to_owned())]
    pub launch_policy: String,
    /// `loopback` or `container`.
    #[ortho_config(default = "loopback".to_owned())]
    pub host_resolution: String,
    /// Host address the SSH port is published on.
    #[ortho_config(default = "127.0.0.1".to_owned())]
    pub publish_address: String,
    /// Remote directory used as the first hop of file transfers.
    #[ortho_config(default = "/tmp".to_owned())]
    pub remote_tmp_dir: String,
    /// Test run identifier labelled onto every image and container so the
    /// janitor can find leaks.
    pub test_run_id: Option<String>,
}

/// Docker client settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH_DOCKER",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct DockerConfig {
    /// Path to the Docker CLI binary.
    #[ortho_config(default = DEFAULT_DOCKER_BIN.to_owned())]
    pub docker_bin: String,
    /// Wall-clock limit for each runtime call in seconds; 0 disables it.
    /// Image builds and pulls run under the same limit.
    #[ortho_config(default = 900)]
    pub command_timeout_secs: u64,
}

/// How a launch reacts to a failing node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LaunchPolicy {
    /// Abort the launch at the first failing node. Image build failures
    /// only fail their own node.
    #[default]
    FailFast,
    /// Record the failure and carry on with the remaining nodes.
    Isolated,
}

impl FromStr for LaunchPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "fail-fast" => Ok(Self::FailFast),
            "isolated" => Ok(Self::Isolated),
            other => Err(invalid(
                &LAUNCH_POLICY,
                other,
                "expected fail-fast or isolated",
            )),
        }
    }
}

/// Which address connect dials for a container.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HostResolution {
    /// The publish address on the host, with the runtime-mapped port.
    #[default]
    Loopback,
    /// The container's own network address, with the container port.
    Container,
}

impl FromStr for HostResolution {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "loopback" => Ok(Self::Loopback),
            "container" => Ok(Self::Container),
            other => Err(invalid(
                &HOST_RESOLUTION,
                other,
                "expected loopback or container",
            )),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

const IMAGE_PREFIX: FieldMetadata =
    FieldMetadata::new("image name prefix", "BERTH_IMAGE_PREFIX", "image_prefix");
const WORK_DIR: FieldMetadata =
    FieldMetadata::new("build artifact directory", "BERTH_WORK_DIR", "work_dir");
const LAUNCH_POLICY: FieldMetadata =
    FieldMetadata::new("launch policy", "BERTH_LAUNCH_POLICY", "launch_policy");
const HOST_RESOLUTION: FieldMetadata =
    FieldMetadata::new("host resolution", "BERTH_HOST_RESOLUTION", "host_resolution");
const PUBLISH_ADDRESS: FieldMetadata =
    FieldMetadata::new("publish address", "BERTH_PUBLISH_ADDRESS", "publish_address");
const REMOTE_TMP_DIR: FieldMetadata =
    FieldMetadata::new("remote temporary directory", "BERTH_REMOTE_TMP_DIR", "remote_tmp_dir");
const TEST_RUN_ID: FieldMetadata =
    FieldMetadata::new("test run id", "BERTH_TEST_RUN_ID", "test_run_id");
const DOCKER_BIN: FieldMetadata =
    FieldMetadata::new("Docker CLI binary", "BERTH_DOCKER_DOCKER_BIN", "docker_bin");

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to berth.toml",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

fn invalid(metadata: &FieldMetadata, value: &str, expectation: &str) -> ConfigError {
    ConfigError::InvalidValue(format!(
        "invalid {} {value:?} ({expectation}): fix {} or {} in berth.toml",
        metadata.description, metadata.env_var, metadata.toml_key
    ))
}

/// Lifecycle settings after validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// Destroy policy.
    pub destroy: bool,
    /// Prefix for generated image names.
    pub image_prefix: String,
    /// Directory receiving build artifacts.
    pub work_dir: Utf8PathBuf,
    /// Launch failure policy.
    pub launch_policy: LaunchPolicy,
    /// Connect address policy.
    pub host_resolution: HostResolution,
    /// Host address the SSH port is published on.
    pub publish_address: IpAddr,
    /// Remote directory for transfer staging.
    pub remote_tmp_dir: String,
    /// Test run identifier for resource labels.
    pub test_run_id: Option<String>,
}

impl LifecycleConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("berth")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation and parses enumerated values. Error
    /// messages name the environment variable and TOML key to fix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::InvalidValue`] for unparsable ones.
    pub fn validate(&self) -> Result<LifecycleSettings, ConfigError> {
        require_field(&self.image_prefix, &IMAGE_PREFIX)?;
        require_field(&self.work_dir, &WORK_DIR)?;
        require_field(&self.remote_tmp_dir, &REMOTE_TMP_DIR)?;
        if let Some(id) = self.test_run_id.as_deref() {
            require_field(id, &TEST_RUN_ID)?;
        }

        let prefix = self.image_prefix.trim();
        if !prefix.chars().all(|ch| {
            ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.')
        }) {
            return Err(invalid(
                &IMAGE_PREFIX,
                prefix,
                "use lowercase letters, digits, '-', '_' or '.'",
            ));
        }

        let publish_address = self
            .publish_address
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| {
                invalid(
                    &PUBLISH_ADDRESS,
                    &self.publish_address,
                    "expected an IP address",
                )
            })?;

        Ok(LifecycleSettings {
            destroy: self.destroy,
            image_prefix: prefix.to_owned(),
            work_dir: Utf8PathBuf::from(self.work_dir.trim()),
            launch_policy: self.launch_policy.parse()?,
            host_resolution: self.host_resolution.parse()?,
            publish_address,
            remote_tmp_dir: self.remote_tmp_dir.trim().to_owned(),
            test_run_id: self.test_run_id.as_deref().map(|id| id.trim().to_owned()),
        })
    }
}

impl DockerConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("berth")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures the binary is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `docker_bin` is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(&self.docker_bin, &DOCKER_BIN)
    }

    /// Per-call timeout as a [`Duration`]; zero means unlimited.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value cannot be interpreted.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
