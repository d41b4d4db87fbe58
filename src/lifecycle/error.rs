//! Errors surfaced by the lifecycle to the test harness.

use std::fmt::Display;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::image::BuildError;
use crate::node::NodeError;
use crate::runtime::RuntimeError;
use crate::ssh::{SshConfigError, SshError};
use crate::types::ContainerId;

/// Errors raised by lifecycle operations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when lifecycle or Docker settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when SSH settings are invalid.
    #[error(transparent)]
    SshConfig(#[from] SshConfigError),
    /// Raised when the runtime availability probe was timed out or
    /// cancelled. The operation did nothing.
    #[error("container runtime probe was interrupted: {source}")]
    Interrupted {
        /// Underlying runtime error.
        #[source]
        source: RuntimeError,
    },
    /// Raised when a node specification is defective. The whole batch is
    /// rejected before any runtime call.
    #[error("invalid node set: {0}")]
    Node(#[from] NodeError),
    /// Raised when launch targets a node the registry already holds.
    #[error("node {node} is already launched; tear the registry down before launching it again")]
    AlreadyLaunched {
        /// Node name.
        node: String,
    },
    /// Raised when a shared directory cannot be resolved to an absolute
    /// UTF-8 host path.
    #[error("shared directory {path} of node {node} cannot be mounted: {message}")]
    SharedDirectory {
        /// Node name.
        node: String,
        /// Configured host path.
        path: Utf8PathBuf,
        /// Resolution failure.
        message: String,
    },
    /// Raised when the build artifact cannot be written.
    #[error("failed to write build artifact for node {node}: {source}")]
    Artifact {
        /// Node name.
        node: String,
        /// Underlying artifact error.
        #[source]
        source: BuildError,
    },
    /// Raised when the runtime rejects an image build. Recorded per node so
    /// that sibling nodes still launch.
    #[error("image build for node {node} failed: {source}")]
    Build {
        /// Node name.
        node: String,
        /// Underlying runtime error.
        #[source]
        source: RuntimeError,
    },
    /// Raised when a runtime operation fails for a node.
    #[error("runtime {operation} failed for node {node}: {message}")]
    Runtime {
        /// Node name.
        node: String,
        /// Operation that failed.
        operation: String,
        /// Failure description, including any cleanup note.
        message: String,
        /// Underlying runtime error.
        #[source]
        source: RuntimeError,
    },
    /// Raised when the runtime reports success but prints no container id.
    #[error("container for node {node} was not created: {message}")]
    EmptyContainerId {
        /// Node name.
        node: String,
        /// Failure description, including any cleanup note.
        message: String,
    },
    /// Raised when connect finds the container stopped.
    #[error("container {id} of node {node} is not running")]
    NotRunning {
        /// Node name.
        node: String,
        /// Container id.
        id: ContainerId,
    },
    /// Raised when no host port is mapped to the SSH port.
    #[error("container {id} of node {node} has no host port mapped to its ssh port")]
    MissingPort {
        /// Node name.
        node: String,
        /// Container id.
        id: ContainerId,
    },
    /// Raised when the container has no network address.
    #[error("container {id} of node {node} has no network address")]
    MissingAddress {
        /// Node name.
        node: String,
        /// Container id.
        id: ContainerId,
    },
    /// Raised when an SSH operation fails.
    #[error("ssh to node {node} failed: {source}")]
    Ssh {
        /// Node name.
        node: String,
        /// Underlying SSH error.
        #[source]
        source: SshError,
    },
    /// Raised when an operation names a node the registry does not hold.
    #[error("node {node} is not registered")]
    UnknownNode {
        /// Node name.
        node: String,
    },
    /// Raised when a node has no open SSH session.
    #[error("node {node} has no open ssh session; connect first")]
    NotConnected {
        /// Node name.
        node: String,
    },
    /// Raised after teardown processed every node but some removals failed.
    #[error("teardown left resources behind: {}", .failures.join("; "))]
    Teardown {
        /// One description per failed removal.
        failures: Vec<String>,
    },
}

pub(super) fn append_cleanup_note<E: Display>(
    message: String,
    cleanup_error: Option<&E>,
) -> String {
    if let Some(cleanup) = cleanup_error {
        format!("{message} (cleanup also failed: {cleanup})")
    } else {
        message
    }
}
