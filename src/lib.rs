//! Disposable SSH-reachable container fixtures for integration test harnesses.
//!
//! The crate builds a per-node image from a base image plus customisation
//! commits and an SSH bootstrap, starts one container per node with its SSH
//! port published on an ephemeral host port, opens SSH sessions to them, and
//! tears everything down again. State lives in a [`Registry`] owned by the
//! harness; every phase is a method on [`Lifecycle`].

pub mod buildspec;
pub mod command;
pub mod config;
pub mod image;
pub mod janitor;
pub mod lifecycle;
pub mod logging;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod ssh;
pub mod test_support;
pub mod types;

pub use buildspec::{BuildSpec, SshBootstrap};
pub use command::{
    CancellationToken, CommandError, CommandOutput, CommandRunner, ProcessCommandRunner,
};
pub use config::{
    ConfigError, DockerConfig, HostResolution, LaunchPolicy, LifecycleConfig, LifecycleSettings,
};
pub use janitor::{
    Janitor, JanitorConfig, JanitorError, SweepSummary, TEST_RUN_ID_ENV, TEST_RUN_LABEL,
};
pub use lifecycle::{
    DockerLifecycle, LaunchReport, Lifecycle, LifecycleError, NodeFailure, PROVIDER_TYPE,
    TeardownSummary,
};
pub use node::{Commit, NodeError, NodeSpec, NodeSpecBuilder, PrefabSpecifics, SharedDirectory};
pub use registry::{Registry, RegistryEntry};
pub use runtime::{ContainerRuntime, DockerCli, RuntimeError};
pub use ssh::{
    OpenSsh, RemoteCommandOutput, SshConfig, SshEndpoint, SshError, SshSession, SshTransport,
};
pub use types::{ContainerId, ImageName};
