//! Typed container-runtime interface.
//!
//! [`ContainerRuntime`] exposes one method per runtime operation the lifecycle
//! needs. Every user-controlled value (image name, hostname, path, label) is
//! passed as a structured field, never interpolated into a shell string.

mod docker;

use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::command::CommandError;
use crate::types::{ContainerId, ImageName};

pub use docker::{DEFAULT_DOCKER_BIN, DockerCli};

/// Key/value label attached to images and containers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Label {
    /// Label key.
    pub key: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Creates a label.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Renders the label as `key=value`.
    #[must_use]
    pub fn pair(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

/// Read-only bind mount from the host into a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindMount {
    /// Absolute host path.
    pub source: Utf8PathBuf,
    /// Mount point inside the container.
    pub destination: Utf8PathBuf,
}

/// Parameters for an image build.
#[derive(Clone, Debug)]
pub struct BuildRequest<'a> {
    /// Tag applied to the built image.
    pub tag: &'a ImageName,
    /// Rendered build specification on disk.
    pub buildfile: &'a Utf8Path,
    /// Labels applied to the image.
    pub labels: &'a [Label],
}

/// Parameters for starting a container.
#[derive(Clone, Debug)]
pub struct RunRequest<'a> {
    /// Image to run.
    pub image: &'a ImageName,
    /// Hostname set inside the container.
    pub hostname: &'a str,
    /// Host address the container port is published on; the host port is
    /// chosen by the runtime.
    pub publish_address: IpAddr,
    /// Container port to publish.
    pub container_port: u16,
    /// Read-only bind mounts.
    pub binds: &'a [BindMount],
    /// Labels applied to the container.
    pub labels: &'a [Label],
}

/// Resource kinds the janitor can enumerate and remove.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// Containers, running or stopped.
    Container,
    /// Images.
    Image,
}

impl ResourceKind {
    /// Lower-case plural used in log and error messages.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::Image => "images",
        }
    }
}

/// Errors surfaced by a container runtime.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RuntimeError {
    /// Raised when the runtime client process cannot be run.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the runtime reports a failed operation.
    #[error("{program} {operation} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Runtime client program.
        program: String,
        /// Operation that failed (for example `build`).
        operation: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when runtime output cannot be interpreted.
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// Operation whose output was malformed.
        operation: String,
        /// Parser error message.
        message: String,
    },
}

/// Operations the lifecycle needs from a container runtime.
pub trait ContainerRuntime {
    /// Cheap, idempotent liveness probe of the runtime daemon. An
    /// unreachable daemon or missing client yields `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Command`] when the probe was timed out or
    /// cancelled, since neither says anything about the daemon.
    fn is_available(&self) -> Result<bool, RuntimeError>;

    /// Returns whether `image` is present locally.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the query itself cannot run.
    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pulls `image` from the configured registry.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the pull fails.
    fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Builds and tags an image from a build artifact.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the build fails.
    fn build_image(&self, request: &BuildRequest<'_>) -> Result<(), RuntimeError>;

    /// Starts a detached container and returns its id, which may be empty
    /// when the runtime printed nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the run fails.
    fn run_container(&self, request: &RunRequest<'_>) -> Result<ContainerId, RuntimeError>;

    /// Host port bound to `container_port`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the query fails or its output is
    /// malformed.
    fn mapped_port(
        &self,
        id: &ContainerId,
        container_port: u16,
    ) -> Result<Option<u16>, RuntimeError>;

    /// Address of the container on its network, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when inspection fails.
    fn container_address(&self, id: &ContainerId) -> Result<Option<IpAddr>, RuntimeError>;

    /// Returns whether the container is running.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when inspection fails.
    fn container_running(&self, id: &ContainerId) -> Result<bool, RuntimeError>;

    /// Kills a running container.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the kill fails.
    fn kill_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Removes a stopped container.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when removal fails.
    fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Removes an image.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when removal fails.
    fn remove_image(&self, image: &ImageName) -> Result<(), RuntimeError>;

    /// Lists ids of resources of `kind` carrying `label`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when listing fails or output is malformed.
    fn list_labelled(
        &self,
        kind: ResourceKind,
        label: &Label,
    ) -> Result<Vec<String>, RuntimeError>;

    /// Removes a resource regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when removal fails.
    fn force_remove(&self, kind: ResourceKind, id: &str) -> Result<(), RuntimeError>;
}

