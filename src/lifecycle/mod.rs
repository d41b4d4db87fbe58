//! Container lifecycle: launch, connect, teardown and file transfer.
//!
//! Every phase walks the nodes sequentially and reads or writes the
//! [`Registry`] passed in by the harness. Launch, build, connect and teardown
//! first probe the runtime; when it is unreachable they log the skip and
//! return successfully so suites can run on hosts without a container
//! runtime.
//!
//! External calls are bounded by the timeouts configured on the command
//! runners and observe a shared [`CancellationToken`]. A probe that was
//! interrupted is an error, not an unavailable runtime.

mod error;

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buildspec::{self, BuildSpec, SSH_PORT, SshBootstrap};
use crate::command::{CancellationToken, ProcessCommandRunner};
use crate::config::{DockerConfig, HostResolution, LaunchPolicy, LifecycleConfig, LifecycleSettings};
use crate::image::BuildArtifact;
use crate::janitor::TEST_RUN_LABEL;
use crate::node::{NodeError, NodeSpec};
use crate::registry::{Registry, RegistryEntry};
use crate::runtime::{
    BindMount, BuildRequest, ContainerRuntime, DockerCli, Label, RunRequest, RuntimeError,
};
use crate::ssh::{OpenSsh, RemoteCommandOutput, SshConfig, SshEndpoint, SshSession, SshTransport};
use crate::types::{ContainerId, ImageName};

pub use error::LifecycleError;
use error::append_cleanup_note;

/// Provider identifier reported to the harness.
pub const PROVIDER_TYPE: &str = "docker";

/// Lifecycle wired to the Docker CLI and the system OpenSSH client.
pub type DockerLifecycle =
    Lifecycle<DockerCli<ProcessCommandRunner>, OpenSsh<ProcessCommandRunner>>;

/// A node that failed to launch without aborting its siblings.
#[derive(Debug, Eq, PartialEq)]
pub struct NodeFailure {
    /// Node name.
    pub node: String,
    /// Why the launch failed.
    pub error: LifecycleError,
}

/// Outcome of a launch.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct LaunchReport {
    /// Nodes registered by this launch, in launch order.
    pub launched: Vec<String>,
    /// Nodes that failed without aborting the launch.
    pub failed: Vec<NodeFailure>,
    /// `true` when the runtime was unavailable and nothing happened.
    pub skipped: bool,
}

impl LaunchReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Returns `true` when every requested node launched.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.skipped && self.failed.is_empty()
    }
}

/// Outcome of a teardown.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct TeardownSummary {
    /// SSH sessions closed successfully.
    pub closed_sessions: usize,
    /// Containers removed.
    pub removed_containers: usize,
    /// Images removed.
    pub removed_images: usize,
    /// Nodes whose container and image were kept because destroy is off.
    pub kept: Vec<String>,
    /// Nodes skipped because their container was never created.
    pub skipped: Vec<String>,
}

/// Orchestrates fixture containers over a runtime and an SSH transport.
#[derive(Debug)]
pub struct Lifecycle<C: ContainerRuntime, S: SshTransport> {
    runtime: C,
    ssh: S,
    settings: LifecycleSettings,
    bootstrap: SshBootstrap,
}

impl DockerLifecycle {
    /// Builds a lifecycle from layered configuration. Runtime calls and SSH
    /// processes run under their configured timeouts and stop when
    /// `cancellation` fires.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] or [`LifecycleError::SshConfig`]
    /// when validation fails.
    pub fn from_config(
        lifecycle: &LifecycleConfig,
        docker: &DockerConfig,
        ssh: SshConfig,
        cancellation: &CancellationToken,
    ) -> Result<Self, LifecycleError> {
        let settings = lifecycle.validate()?;
        docker.validate()?;
        ssh.validate()?;

        let docker_runner = ProcessCommandRunner::new()
            .with_timeout(docker.command_timeout())
            .with_cancellation(cancellation.clone());
        let ssh_runner = ProcessCommandRunner::new()
            .with_timeout(Duration::from_secs(ssh.command_timeout_secs))
            .with_cancellation(cancellation.clone());
        let bootstrap = ssh.bootstrap();

        Ok(Self::new(
            DockerCli::new(docker.docker_bin.trim(), docker_runner),
            OpenSsh::new(ssh, ssh_runner),
            settings,
            bootstrap,
        ))
    }

    /// Loads every configuration layer from files and the environment, then
    /// calls [`Lifecycle::from_config`].
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when loading or validation fails.
    pub fn load(cancellation: &CancellationToken) -> Result<Self, LifecycleError> {
        let lifecycle = LifecycleConfig::load_without_cli_args()?;
        let docker = DockerConfig::load_without_cli_args()?;
        let ssh = SshConfig::load_without_cli_args()?;
        Self::from_config(&lifecycle, &docker, ssh, cancellation)
    }
}

impl<C: ContainerRuntime, S: SshTransport> Lifecycle<C, S> {
    /// Creates a lifecycle from its collaborators. `bootstrap` must set the
    /// password the transport authenticates with.
    #[must_use]
    pub const fn new(
        runtime: C,
        ssh: S,
        settings: LifecycleSettings,
        bootstrap: SshBootstrap,
    ) -> Self {
        Self {
            runtime,
            ssh,
            settings,
            bootstrap,
        }
    }

    /// Validated settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Whether the container runtime is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Interrupted`] when the probe was timed out
    /// or cancelled.
    pub fn available(&self) -> Result<bool, LifecycleError> {
        self.runtime
            .is_available()
            .map_err(|source| LifecycleError::Interrupted { source })
    }

    /// Launches one container per node and registers it.
    ///
    /// Node specs are validated as a batch before any runtime call. A
    /// rejected image build only fails its own node and is collected in the
    /// report. Under [`LaunchPolicy::FailFast`] any other node failure is
    /// returned; nodes launched before it stay registered so teardown
    /// reclaims them. Under [`LaunchPolicy::Isolated`] every failure is
    /// collected in the report.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Interrupted`] when the runtime probe was
    /// timed out or cancelled, [`LifecycleError::Node`] for defective specs,
    /// [`LifecycleError::AlreadyLaunched`] when a node is already registered,
    /// and the first node failure under the fail-fast policy.
    pub fn launch(
        &self,
        registry: &mut Registry,
        nodes: &[NodeSpec],
    ) -> Result<LaunchReport, LifecycleError> {
        if !self.available()? {
            info!("container runtime not available, skipping launch");
            return Ok(LaunchReport::skipped());
        }
        Self::validate_batch(registry, nodes)?;

        let mut report = LaunchReport::default();
        for node in nodes {
            match self.launch_node(node) {
                Ok(entry) => {
                    registry.insert(node.name.as_str(), entry);
                    report.launched.push(node.name.clone());
                }
                Err(err) if self.settings.launch_policy == LaunchPolicy::Isolated
                    || matches!(err, LifecycleError::Build { .. }) =>
                {
                    warn!(node = %node.name, error = %err, "node launch failed");
                    report.failed.push(NodeFailure {
                        node: node.name.clone(),
                        error: err,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Writes `spec` to a build artifact and builds `image` from it. The
    /// artifact is removed afterwards under the destroy policy.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Artifact`] when the artifact cannot be
    /// written, [`LifecycleError::Build`] when the build fails, and
    /// [`LifecycleError::Interrupted`] when the runtime probe was cut short.
    pub fn build_image(
        &self,
        node: &str,
        image: &ImageName,
        spec: &BuildSpec,
    ) -> Result<(), LifecycleError> {
        if !self.available()? {
            info!(node, "container runtime not available, skipping image build");
            return Ok(());
        }
        self.build(node, image, spec)
    }

    /// Opens an SSH session for every registered node that lacks one.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotRunning`], [`LifecycleError::MissingPort`]
    /// or [`LifecycleError::MissingAddress`] when a container cannot be
    /// reached, [`LifecycleError::Ssh`] when authentication fails, and
    /// [`LifecycleError::Interrupted`] when the runtime probe was cut short.
    pub fn connect(&self, registry: &mut Registry) -> Result<(), LifecycleError> {
        if !self.available()? {
            info!("container runtime not available, skipping connect");
            return Ok(());
        }

        for (name, entry) in registry.iter_mut() {
            if entry.is_connected() {
                debug!(node = name, "ssh session already open");
                continue;
            }
            if entry.id().is_empty() {
                debug!(node = name, "container never created, skipping connect");
                continue;
            }

            let id = entry.id().clone();
            let running = self
                .runtime
                .container_running(&id)
                .map_err(|err| runtime_error(name, "inspect", err))?;
            if !running {
                return Err(LifecycleError::NotRunning {
                    node: name.to_owned(),
                    id,
                });
            }

            let endpoint = self.resolve_endpoint(name, &id)?;
            let session = self
                .ssh
                .connect(endpoint)
                .map_err(|source| LifecycleError::Ssh {
                    node: name.to_owned(),
                    source,
                })?;
            info!(node = name, container = %id, %endpoint, "ssh session opened");
            entry.attach_session(session);
        }
        Ok(())
    }

    /// Closes sessions and, under the destroy policy, kills and removes every
    /// registered container and its image. The registry is drained.
    ///
    /// Kill failures are logged and removal proceeds. Removal failures are
    /// collected and reported once every node has been processed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Interrupted`] without touching the registry
    /// when the runtime probe was timed out or cancelled, and
    /// [`LifecycleError::Teardown`] listing failed removals.
    pub fn teardown(&self, registry: &mut Registry) -> Result<TeardownSummary, LifecycleError> {
        let mut summary = TeardownSummary::default();
        if !self.available()? {
            info!("container runtime not available, skipping teardown");
            return Ok(summary);
        }
        if registry.is_empty() {
            info!("no nodes registered, nothing to tear down");
            return Ok(summary);
        }

        let mut failures = Vec::new();
        for (name, mut entry) in registry.drain() {
            if entry.id().is_empty() {
                info!(node = %name, "container never created, skipping teardown");
                summary.skipped.push(name);
                continue;
            }

            if let Some(session) = entry.session_mut()
                && !session.is_closed()
            {
                match self.ssh.close(session) {
                    Ok(()) => summary.closed_sessions += 1,
                    Err(err) => warn!(node = %name, error = %err, "failed to close ssh session"),
                }
            }

            if !self.settings.destroy {
                info!(
                    node = %name,
                    container = %entry.id(),
                    image = %entry.image(),
                    "destroy disabled, keeping container and image"
                );
                summary.kept.push(name);
                continue;
            }

            self.destroy_entry(&name, &entry, &mut summary, &mut failures);
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(LifecycleError::Teardown { failures })
        }
    }

    /// Runs `command` on `node` over its SSH session.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownNode`] or
    /// [`LifecycleError::NotConnected`] when no session is available, and
    /// [`LifecycleError::Ssh`] when the command cannot be run.
    pub fn run(
        &self,
        registry: &Registry,
        node: &str,
        command: &str,
    ) -> Result<RemoteCommandOutput, LifecycleError> {
        let session = session_for(registry, node)?;
        info!(node, command, "running remote command");
        self.ssh
            .exec(session, command)
            .map_err(|source| LifecycleError::Ssh {
                node: node.to_owned(),
                source,
            })
    }

    /// Copies `source` to `destination` on `node` by uploading to a fresh
    /// temporary path and moving it into place. Returns whether the move
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownNode`] or
    /// [`LifecycleError::NotConnected`] when no session is available, and
    /// [`LifecycleError::Ssh`] when the upload or move cannot be run.
    pub fn transfer(
        &self,
        registry: &Registry,
        node: &str,
        source: &Utf8Path,
        destination: &str,
    ) -> Result<bool, LifecycleError> {
        let session = session_for(registry, node)?;
        let ssh_error = |err| LifecycleError::Ssh {
            node: node.to_owned(),
            source: err,
        };

        let staging = format!(
            "{}/berth-{}",
            self.settings.remote_tmp_dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
        info!(node, %source, destination, "transferring files");
        self.ssh
            .upload(session, source, &staging)
            .map_err(ssh_error)?;

        let command = format!(
            "mv {} {}",
            escape(staging.as_str().into()),
            escape(destination.into())
        );
        let output = self.ssh.exec(session, &command).map_err(ssh_error)?;
        if !output.is_success() {
            warn!(
                node,
                destination,
                exit_code = ?output.exit_code,
                stderr = output.stderr.trim(),
                "remote move failed"
            );
        }
        Ok(output.is_success())
    }

    fn validate_batch(registry: &Registry, nodes: &[NodeSpec]) -> Result<(), LifecycleError> {
        let mut seen = BTreeSet::new();
        for node in nodes {
            node.validate()?;
            if !seen.insert(node.name.as_str()) {
                return Err(NodeError::Duplicate {
                    node: node.name.clone(),
                }
                .into());
            }
            if registry.contains(&node.name) {
                return Err(LifecycleError::AlreadyLaunched {
                    node: node.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn launch_node(&self, node: &NodeSpec) -> Result<RegistryEntry, LifecycleError> {
        let name = node.name.as_str();
        let base_image = node.base_image()?;
        let binds = bind_mounts(node)?;

        let present = self
            .runtime
            .image_exists(base_image)
            .map_err(|err| runtime_error(name, "image inspect", err))?;
        if !present {
            info!(node = name, image = base_image, "pulling base image");
            self.runtime
                .pull_image(base_image)
                .map_err(|err| runtime_error(name, "pull", err))?;
        }

        let image = ImageName::unique(&self.settings.image_prefix, name);
        let spec = buildspec::synthesize_with(base_image, &node.commits, &self.bootstrap);
        self.build(name, &image, &spec)?;

        let labels = self.labels();
        let request = RunRequest {
            image: &image,
            hostname: name,
            publish_address: self.settings.publish_address,
            container_port: SSH_PORT,
            binds: &binds,
            labels: &labels,
        };
        let id = match self.runtime.run_container(&request) {
            Ok(id) => id,
            Err(err) => {
                let message =
                    append_cleanup_note(err.to_string(), self.discard_image(&image).as_ref());
                return Err(LifecycleError::Runtime {
                    node: name.to_owned(),
                    operation: String::from("run"),
                    message,
                    source: err,
                });
            }
        };
        if id.is_empty() {
            let message = append_cleanup_note(
                String::from("the runtime returned an empty container id"),
                self.discard_image(&image).as_ref(),
            );
            return Err(LifecycleError::EmptyContainerId {
                node: name.to_owned(),
                message,
            });
        }

        info!(node = name, image = %image, container = %id, "container launched");
        Ok(RegistryEntry::new(id, image))
    }

    fn build(&self, node: &str, image: &ImageName, spec: &BuildSpec) -> Result<(), LifecycleError> {
        let artifact = BuildArtifact::write(&self.settings.work_dir, image, spec).map_err(|source| {
            LifecycleError::Artifact {
                node: node.to_owned(),
                source,
            }
        })?;
        info!(node, image = %image, artifact = %artifact.path(), "building image");

        let labels = self.labels();
        let result = self.runtime.build_image(&BuildRequest {
            tag: image,
            buildfile: artifact.path(),
            labels: &labels,
        });

        if self.settings.destroy {
            let path = artifact.path().to_path_buf();
            if let Err(err) = artifact.remove() {
                warn!(node, artifact = %path, error = %err, "failed to remove build artifact");
            }
        } else {
            debug!(node, artifact = %artifact.path(), "keeping build artifact");
        }

        result.map_err(|source| LifecycleError::Build {
            node: node.to_owned(),
            source,
        })
    }

    /// Removes an image whose container never started, under the destroy
    /// policy, returning the cleanup failure if any.
    fn discard_image(&self, image: &ImageName) -> Option<RuntimeError> {
        if !self.settings.destroy {
            return None;
        }
        self.runtime.remove_image(image).err()
    }

    fn destroy_entry(
        &self,
        name: &str,
        entry: &RegistryEntry,
        summary: &mut TeardownSummary,
        failures: &mut Vec<String>,
    ) {
        let id = entry.id();
        let image = entry.image();

        info!(node = name, container = %id, "killing container");
        if let Err(err) = self.runtime.kill_container(id) {
            warn!(node = name, container = %id, error = %err, "failed to kill container");
        }

        info!(node = name, container = %id, "removing container");
        if let Err(err) = self.runtime.remove_container(id) {
            failures.push(format!("node {name}: container {id}: {err}"));
            return;
        }
        summary.removed_containers += 1;

        info!(node = name, image = %image, "removing image");
        match self.runtime.remove_image(image) {
            Ok(()) => summary.removed_images += 1,
            Err(err) => failures.push(format!("node {name}: image {image}: {err}")),
        }
    }

    fn resolve_endpoint(
        &self,
        node: &str,
        id: &ContainerId,
    ) -> Result<SshEndpoint, LifecycleError> {
        match self.settings.host_resolution {
            HostResolution::Loopback => {
                let port = self
                    .runtime
                    .mapped_port(id, SSH_PORT)
                    .map_err(|err| runtime_error(node, "port", err))?
                    .ok_or_else(|| LifecycleError::MissingPort {
                        node: node.to_owned(),
                        id: id.clone(),
                    })?;
                Ok(SshEndpoint {
                    address: reachable(self.settings.publish_address),
                    port,
                })
            }
            HostResolution::Container => {
                let address = self
                    .runtime
                    .container_address(id)
                    .map_err(|err| runtime_error(node, "inspect", err))?
                    .ok_or_else(|| LifecycleError::MissingAddress {
                        node: node.to_owned(),
                        id: id.clone(),
                    })?;
                Ok(SshEndpoint {
                    address,
                    port: SSH_PORT,
                })
            }
        }
    }

    fn labels(&self) -> Vec<Label> {
        self.settings
            .test_run_id
            .iter()
            .map(|id| Label::new(TEST_RUN_LABEL, id.as_str()))
            .collect()
    }
}

fn runtime_error(node: &str, operation: &str, source: RuntimeError) -> LifecycleError {
    LifecycleError::Runtime {
        node: node.to_owned(),
        operation: operation.to_owned(),
        message: source.to_string(),
        source,
    }
}

fn session_for<'a>(registry: &'a Registry, node: &str) -> Result<&'a SshSession, LifecycleError> {
    let entry = registry.get(node).ok_or_else(|| LifecycleError::UnknownNode {
        node: node.to_owned(),
    })?;
    entry
        .session()
        .filter(|session| !session.is_closed())
        .ok_or_else(|| LifecycleError::NotConnected {
            node: node.to_owned(),
        })
}

/// Publishing on an unspecified address binds every interface; dial loopback.
const fn reachable(publish_address: IpAddr) -> IpAddr {
    match publish_address {
        IpAddr::V4(addr) if addr.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(addr) if addr.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

fn bind_mounts(node: &NodeSpec) -> Result<Vec<BindMount>, LifecycleError> {
    node.shared_directories
        .iter()
        .map(|shared| {
            let failure = |message: String| LifecycleError::SharedDirectory {
                node: node.name.clone(),
                path: shared.source.clone(),
                message,
            };
            let absolute =
                std::path::absolute(&shared.source).map_err(|err| failure(err.to_string()))?;
            let source = Utf8PathBuf::from_path_buf(absolute)
                .map_err(|path| failure(format!("{} is not valid UTF-8", path.display())))?;
            Ok(BindMount {
                source,
                destination: shared.destination.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests;
