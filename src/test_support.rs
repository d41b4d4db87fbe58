//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::IpAddr;
use std::rc::Rc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::command::{CommandError, CommandInvocation, CommandOutput, CommandRunner};
use crate::config::{DockerConfig, LifecycleConfig};
use crate::runtime::{
    BuildRequest, ContainerRuntime, Label, ResourceKind, RunRequest, RuntimeError,
};
use crate::ssh::{RemoteCommandOutput, SshConfig, SshEndpoint, SshError, SshSession, SshTransport};
use crate::types::{ContainerId, ImageName};

/// Container id returned by [`RecordingRuntime`] unless overridden.
pub const STUB_CONTAINER_ID: &str = "abc123abc123";

/// Host port reported by [`RecordingRuntime`] unless overridden.
pub const STUB_MAPPED_PORT: u16 = 2222;

type ScriptedResponse = Result<CommandOutput, CommandError>;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<ScriptedResponse>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a runner error, as if the process could not be supervised.
    pub fn push_error(&self, error: CommandError) {
        self.responses.borrow_mut().push_back(Err(error));
    }

    fn respond(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&Utf8Path>,
    ) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            stdin: stdin.map(Utf8Path::to_path_buf),
        });
        self.responses.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.respond(program, args, None)
    }

    fn run_with_stdin(
        &self,
        program: &str,
        args: &[OsString],
        input: &Utf8Path,
    ) -> Result<CommandOutput, CommandError> {
        self.respond(program, args, Some(input))
    }
}

/// Runtime operation recorded by [`RecordingRuntime`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeCall {
    /// Availability probe.
    Probe,
    /// Local image query.
    ImageExists(String),
    /// Image pull.
    Pull(String),
    /// Image build.
    Build {
        /// Image tag.
        tag: String,
        /// Artifact path.
        buildfile: Utf8PathBuf,
        /// Artifact contents at build time.
        contents: String,
        /// Labels as `key=value`.
        labels: Vec<String>,
    },
    /// Container start.
    Run {
        /// Image started.
        image: String,
        /// Container hostname.
        hostname: String,
        /// Bind mounts as `source:destination`.
        binds: Vec<String>,
        /// Labels as `key=value`.
        labels: Vec<String>,
    },
    /// Mapped port query.
    MappedPort(String),
    /// Container address query.
    Address(String),
    /// Running-state query.
    Running(String),
    /// Container kill.
    Kill(String),
    /// Container removal.
    RemoveContainer(String),
    /// Image removal.
    RemoveImage(String),
    /// Labelled resource listing.
    List(ResourceKind, String),
    /// Forced removal.
    ForceRemove(ResourceKind, String),
}

#[derive(Debug)]
struct RuntimeState {
    available: bool,
    probe_error: Option<RuntimeError>,
    local_images: BTreeSet<String>,
    container_id: String,
    mapped_port: Option<u16>,
    address: Option<IpAddr>,
    running: bool,
    failing_builds: BTreeSet<String>,
    failing_runs: BTreeSet<String>,
    fail_kill: bool,
    fail_remove_container: bool,
    fail_remove_image: bool,
    containers: Vec<String>,
    images: Vec<String>,
    sticky: bool,
    calls: Vec<RuntimeCall>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            available: true,
            probe_error: None,
            local_images: BTreeSet::new(),
            container_id: STUB_CONTAINER_ID.to_owned(),
            mapped_port: Some(STUB_MAPPED_PORT),
            address: None,
            running: true,
            failing_builds: BTreeSet::new(),
            failing_runs: BTreeSet::new(),
            fail_kill: false,
            fail_remove_container: false,
            fail_remove_image: false,
            containers: Vec::new(),
            images: Vec::new(),
            sticky: false,
            calls: Vec::new(),
        }
    }
}

/// In-memory [`ContainerRuntime`] that records every call.
///
/// Clones share state, so a test can keep a handle after moving one into a
/// lifecycle.
#[derive(Clone, Debug, Default)]
pub struct RecordingRuntime {
    state: Rc<RefCell<RuntimeState>>,
}

impl RecordingRuntime {
    /// Creates an available runtime that returns [`STUB_CONTAINER_ID`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.borrow().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Sets the availability probe result.
    pub fn set_available(&self, available: bool) {
        self.state.borrow_mut().available = available;
    }

    /// Makes the availability probe report a cancelled runtime client.
    pub fn cancel_probe(&self) {
        self.state.borrow_mut().probe_error = Some(RuntimeError::Command(CommandError::Cancelled {
            program: String::from("recording"),
        }));
    }

    /// Marks `image` as present locally so no pull happens.
    pub fn add_local_image(&self, image: &str) {
        self.state.borrow_mut().local_images.insert(image.to_owned());
    }

    /// Sets the id returned by container runs.
    pub fn set_container_id(&self, id: &str) {
        self.state.borrow_mut().container_id = id.to_owned();
    }

    /// Sets the mapped port reported for every container.
    pub fn set_mapped_port(&self, port: Option<u16>) {
        self.state.borrow_mut().mapped_port = port;
    }

    /// Sets the container network address.
    pub fn set_address(&self, address: Option<IpAddr>) {
        self.state.borrow_mut().address = address;
    }

    /// Sets the running-state probe result.
    pub fn set_running(&self, running: bool) {
        self.state.borrow_mut().running = running;
    }

    /// Fails builds whose tag contains `node`.
    pub fn fail_build_for(&self, node: &str) {
        self.state
            .borrow_mut()
            .failing_builds
            .insert(node.to_ascii_lowercase());
    }

    /// Fails runs whose hostname equals `hostname`.
    pub fn fail_run_for(&self, hostname: &str) {
        self.state
            .borrow_mut()
            .failing_runs
            .insert(hostname.to_owned());
    }

    /// Fails every kill.
    pub fn fail_kill(&self) {
        self.state.borrow_mut().fail_kill = true;
    }

    /// Fails every container removal.
    pub fn fail_remove_container(&self) {
        self.state.borrow_mut().fail_remove_container = true;
    }

    /// Fails every image removal.
    pub fn fail_remove_image(&self) {
        self.state.borrow_mut().fail_remove_image = true;
    }

    /// Seeds a labelled resource for janitor listings.
    pub fn add_labelled(&self, kind: ResourceKind, id: &str) {
        let mut state = self.state.borrow_mut();
        match kind {
            ResourceKind::Container => state.containers.push(id.to_owned()),
            ResourceKind::Image => state.images.push(id.to_owned()),
        }
    }

    /// Keeps labelled resources listed after forced removal.
    pub fn keep_labelled(&self) {
        self.state.borrow_mut().sticky = true;
    }

    fn record(&self, call: RuntimeCall) {
        self.state.borrow_mut().calls.push(call);
    }
}

fn simulated(operation: &str) -> RuntimeError {
    RuntimeError::CommandFailure {
        program: String::from("recording"),
        operation: operation.to_owned(),
        status: Some(1),
        status_text: String::from("1"),
        stderr: String::from("simulated failure"),
    }
}

fn label_pairs(labels: &[Label]) -> Vec<String> {
    labels.iter().map(Label::pair).collect()
}

impl ContainerRuntime for RecordingRuntime {
    fn is_available(&self) -> Result<bool, RuntimeError> {
        self.record(RuntimeCall::Probe);
        let state = self.state.borrow();
        state.probe_error.clone().map_or(Ok(state.available), Err)
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        self.record(RuntimeCall::ImageExists(image.to_owned()));
        Ok(self.state.borrow().local_images.contains(image))
    }

    fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Pull(image.to_owned()));
        self.state.borrow_mut().local_images.insert(image.to_owned());
        Ok(())
    }

    fn build_image(&self, request: &BuildRequest<'_>) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Build {
            tag: request.tag.to_string(),
            buildfile: request.buildfile.to_path_buf(),
            contents: std::fs::read_to_string(request.buildfile).unwrap_or_default(),
            labels: label_pairs(request.labels),
        });
        let fails = self
            .state
            .borrow()
            .failing_builds
            .iter()
            .any(|node| request.tag.contains(&format!("-{node}-")));
        if fails {
            return Err(simulated("build"));
        }
        Ok(())
    }

    fn run_container(&self, request: &RunRequest<'_>) -> Result<ContainerId, RuntimeError> {
        self.record(RuntimeCall::Run {
            image: request.image.to_string(),
            hostname: request.hostname.to_owned(),
            binds: request
                .binds
                .iter()
                .map(|bind| format!("{}:{}", bind.source, bind.destination))
                .collect(),
            labels: label_pairs(request.labels),
        });
        let state = self.state.borrow();
        if state.failing_runs.contains(request.hostname) {
            return Err(simulated("run"));
        }
        Ok(ContainerId::new(state.container_id.as_str()))
    }

    fn mapped_port(
        &self,
        id: &ContainerId,
        _container_port: u16,
    ) -> Result<Option<u16>, RuntimeError> {
        self.record(RuntimeCall::MappedPort(id.to_string()));
        Ok(self.state.borrow().mapped_port)
    }

    fn container_address(&self, id: &ContainerId) -> Result<Option<IpAddr>, RuntimeError> {
        self.record(RuntimeCall::Address(id.to_string()));
        Ok(self.state.borrow().address)
    }

    fn container_running(&self, id: &ContainerId) -> Result<bool, RuntimeError> {
        self.record(RuntimeCall::Running(id.to_string()));
        Ok(self.state.borrow().running)
    }

    fn kill_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Kill(id.to_string()));
        if self.state.borrow().fail_kill {
            return Err(simulated("kill"));
        }
        Ok(())
    }

    fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveContainer(id.to_string()));
        if self.state.borrow().fail_remove_container {
            return Err(simulated("rm"));
        }
        Ok(())
    }

    fn remove_image(&self, image: &ImageName) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveImage(image.to_string()));
        if self.state.borrow().fail_remove_image {
            return Err(simulated("rmi"));
        }
        Ok(())
    }

    fn list_labelled(
        &self,
        kind: ResourceKind,
        label: &Label,
    ) -> Result<Vec<String>, RuntimeError> {
        self.record(RuntimeCall::List(kind, label.pair()));
        let state = self.state.borrow();
        Ok(match kind {
            ResourceKind::Container => state.containers.clone(),
            ResourceKind::Image => state.images.clone(),
        })
    }

    fn force_remove(&self, kind: ResourceKind, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::ForceRemove(kind, id.to_owned()));
        let mut state = self.state.borrow_mut();
        if !state.sticky {
            match kind {
                ResourceKind::Container => state.containers.retain(|existing| existing != id),
                ResourceKind::Image => state.images.retain(|existing| existing != id),
            }
        }
        Ok(())
    }
}

/// SSH operation recorded by [`RecordingSsh`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SshCall {
    /// Session opened.
    Connect(SshEndpoint),
    /// Remote command.
    Exec {
        /// Target endpoint.
        endpoint: SshEndpoint,
        /// Command line.
        command: String,
    },
    /// Recursive upload.
    Upload {
        /// Local source path.
        source: Utf8PathBuf,
        /// Remote destination path.
        destination: String,
    },
    /// Session closed.
    Close(SshEndpoint),
}

#[derive(Debug)]
struct SshState {
    exec_exit_code: Option<i32>,
    fail_connect: bool,
    fail_upload: bool,
    fail_close: bool,
    calls: Vec<SshCall>,
}

/// In-memory [`SshTransport`] that records every call and hands out the same
/// session handle for a given endpoint.
#[derive(Clone, Debug)]
pub struct RecordingSsh {
    state: Rc<RefCell<SshState>>,
}

impl Default for RecordingSsh {
    fn default() -> Self {
        Self {
            state: Rc::new(RefCell::new(SshState {
                exec_exit_code: Some(0),
                fail_connect: false,
                fail_upload: false,
                fail_close: false,
                calls: Vec::new(),
            })),
        }
    }
}

impl RecordingSsh {
    /// Creates a transport whose commands succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<SshCall> {
        self.state.borrow().calls.clone()
    }

    /// Sets the exit code reported by remote commands.
    pub fn set_exec_exit_code(&self, code: Option<i32>) {
        self.state.borrow_mut().exec_exit_code = code;
    }

    /// Fails every connection attempt.
    pub fn fail_connect(&self) {
        self.state.borrow_mut().fail_connect = true;
    }

    /// Fails every upload.
    pub fn fail_upload(&self) {
        self.state.borrow_mut().fail_upload = true;
    }

    /// Fails every session close, leaving the session open.
    pub fn fail_close(&self) {
        self.state.borrow_mut().fail_close = true;
    }

    fn record(&self, call: SshCall) {
        self.state.borrow_mut().calls.push(call);
    }

    fn simulated(operation: &str, endpoint: SshEndpoint) -> SshError {
        SshError::CommandFailure {
            program: String::from("recording"),
            operation: operation.to_owned(),
            endpoint: endpoint.to_string(),
            status_text: String::from("255"),
            stderr: String::from("simulated failure"),
        }
    }
}

impl SshTransport for RecordingSsh {
    fn connect(&self, endpoint: SshEndpoint) -> Result<SshSession, SshError> {
        self.record(SshCall::Connect(endpoint));
        if self.state.borrow().fail_connect {
            return Err(Self::simulated("connect", endpoint));
        }
        Ok(SshSession::new(endpoint, "root", "/tmp/berth-recording.sock"))
    }

    fn exec(&self, session: &SshSession, command: &str) -> Result<RemoteCommandOutput, SshError> {
        if session.is_closed() {
            return Err(SshError::SessionClosed {
                endpoint: session.endpoint().to_string(),
            });
        }
        self.record(SshCall::Exec {
            endpoint: session.endpoint(),
            command: command.to_owned(),
        });
        Ok(RemoteCommandOutput {
            exit_code: self.state.borrow().exec_exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn upload(
        &self,
        session: &SshSession,
        source: &Utf8Path,
        destination: &str,
    ) -> Result<(), SshError> {
        self.record(SshCall::Upload {
            source: source.to_path_buf(),
            destination: destination.to_owned(),
        });
        if self.state.borrow().fail_upload {
            return Err(Self::simulated("upload", session.endpoint()));
        }
        Ok(())
    }

    fn close(&self, session: &mut SshSession) -> Result<(), SshError> {
        if session.is_closed() {
            return Ok(());
        }
        if self.state.borrow().fail_close {
            return Err(Self::simulated("close", session.endpoint()));
        }
        session.mark_closed();
        self.record(SshCall::Close(session.endpoint()));
        Ok(())
    }
}

/// Lifecycle settings matching the documented defaults.
#[must_use]
pub fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        destroy: true,
        image_prefix: String::from("berth"),
        work_dir: String::from("."),
        launch_policy: String::from("fail-fast"),
        host_resolution: String::from("loopback"),
        publish_address: String::from("127.0.0.1"),
        remote_tmp_dir: String::from("/tmp"),
        test_run_id: None,
    }
}

/// Docker settings matching the documented defaults.
#[must_use]
pub fn docker_config() -> DockerConfig {
    DockerConfig {
        docker_bin: String::from("docker"),
        command_timeout_secs: 900,
    }
}

/// SSH settings matching the documented defaults.
#[must_use]
pub fn ssh_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        password_bin: String::from("sshpass"),
        user: String::from("root"),
        password: String::from("berth"),
        strict_host_key_checking: false,
        known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 30,
        connection_attempts: 3,
        command_timeout_secs: 600,
        control_dir: String::from("/tmp"),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Unsets variables while holding the global mutex.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Produces `docker ps`/`docker images` output in `{{json .}}` format.
#[must_use]
pub fn json_lines(ids: &[&str]) -> String {
    ids.iter()
        .map(|id| format!("{{\"ID\":\"{id}\",\"Labels\":\"berth.test-run=run\"}}\n"))
        .collect()
}
