//! Unit tests for the lifecycle phases.

use std::net::{IpAddr, Ipv4Addr};

use camino::{Utf8Path, Utf8PathBuf};
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::command::{CancellationToken, CommandError};
use crate::config::LifecycleConfig;
use crate::node::Commit;
use crate::test_support::{
    RecordingRuntime, RecordingSsh, RuntimeCall, STUB_CONTAINER_ID, STUB_MAPPED_PORT, SshCall,
    docker_config, lifecycle_config, ssh_config,
};

const BASE_IMAGE: &str = "ubuntu-1210-docker";

struct Harness {
    runtime: RecordingRuntime,
    ssh: RecordingSsh,
    lifecycle: Lifecycle<RecordingRuntime, RecordingSsh>,
    work_dir: TempDir,
}

impl Harness {
    fn artifacts(&self) -> Vec<String> {
        std::fs::read_dir(self.work_dir.path())
            .expect("read work dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("buildfile-"))
            .collect()
    }
}

fn harness_with(cfg: LifecycleConfig) -> Harness {
    let work_dir = TempDir::new().expect("temp dir");
    let settings = LifecycleSettings {
        work_dir: Utf8PathBuf::from_path_buf(work_dir.path().to_path_buf())
            .expect("utf-8 temp dir"),
        ..cfg.validate().expect("valid settings")
    };
    let runtime = RecordingRuntime::new();
    let ssh = RecordingSsh::new();
    let lifecycle = Lifecycle::new(runtime.clone(), ssh.clone(), settings, SshBootstrap::default());
    Harness {
        runtime,
        ssh,
        lifecycle,
        work_dir,
    }
}

fn harness() -> Harness {
    harness_with(lifecycle_config())
}

fn node(name: &str) -> NodeSpec {
    NodeSpec::builder(name)
        .base_image(BASE_IMAGE)
        .commit(Commit::new("tools", ["apt-get update", "apt-get install -y curl"]))
        .build()
}

fn launched(h: &Harness, names: &[&str]) -> Registry {
    let mut registry = Registry::new();
    let nodes: Vec<NodeSpec> = names.iter().map(|name| node(name)).collect();
    h.lifecycle.launch(&mut registry, &nodes).expect("launch");
    registry
}

fn connected(h: &Harness, names: &[&str]) -> Registry {
    let mut registry = launched(h, names);
    h.lifecycle.connect(&mut registry).expect("connect");
    registry
}

#[rstest]
fn launch_registers_every_node() {
    let h = harness();
    h.runtime.add_local_image(BASE_IMAGE);
    let mut registry = Registry::new();

    let report = h
        .lifecycle
        .launch(&mut registry, &[node("alpha"), node("beta")])
        .expect("launch");

    assert!(report.is_complete());
    assert_eq!(report.launched, vec!["alpha", "beta"]);
    assert_eq!(registry.nodes().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    let entry = registry.get("alpha").expect("alpha registered");
    assert_eq!(entry.id().as_str(), STUB_CONTAINER_ID);
    assert!(entry.image().starts_with("berth-alpha-"));
    assert!(!entry.is_connected());
    assert_eq!(h.runtime.count(|call| matches!(call, RuntimeCall::Pull(_))), 0);
}

#[rstest]
fn launch_pulls_missing_base_image() {
    let h = harness();
    let _registry = launched(&h, &["alpha"]);

    assert_eq!(
        h.runtime.count(|call| *call == RuntimeCall::Pull(BASE_IMAGE.to_owned())),
        1
    );
}

#[rstest]
fn launch_builds_from_synthesized_spec() {
    let h = harness();
    let _registry = launched(&h, &["alpha"]);

    let contents = h
        .runtime
        .calls()
        .into_iter()
        .find_map(|call| match call {
            RuntimeCall::Build { contents, .. } => Some(contents),
            _ => None,
        })
        .expect("build recorded");
    assert!(contents.starts_with("FROM ubuntu-1210-docker\nRUN apt-get update && \\\n"));
    assert!(contents.contains("echo 'root:berth' | chpasswd"));
    assert!(contents.ends_with("ENTRYPOINT [\"/usr/sbin/sshd\", \"-D\"]\n"));
}

#[rstest]
#[case::destroy(true, 0)]
#[case::keep(false, 1)]
fn build_artifact_follows_destroy_policy(#[case] destroy: bool, #[case] remaining: usize) {
    let h = harness_with(LifecycleConfig {
        destroy,
        ..lifecycle_config()
    });
    let _registry = launched(&h, &["alpha"]);

    assert_eq!(h.artifacts().len(), remaining);
}

#[rstest]
fn run_request_carries_hostname_binds_and_labels() {
    let h = harness_with(LifecycleConfig {
        test_run_id: Some(String::from("run-42")),
        ..lifecycle_config()
    });
    let spec = NodeSpec::builder("alpha")
        .base_image(BASE_IMAGE)
        .shared_directory("fixtures", "/srv/fixtures")
        .build();
    let mut registry = Registry::new();
    h.lifecycle.launch(&mut registry, &[spec]).expect("launch");

    let calls = h.runtime.calls();
    let (hostname, binds, labels) = calls
        .iter()
        .find_map(|call| match call {
            RuntimeCall::Run {
                hostname,
                binds,
                labels,
                ..
            } => Some((hostname, binds, labels)),
            _ => None,
        })
        .expect("run recorded");
    assert_eq!(hostname, "alpha");
    assert_eq!(labels, &vec![String::from("berth.test-run=run-42")]);
    let bind = binds.first().expect("one bind");
    assert!(bind.starts_with('/'), "{bind}");
    assert!(bind.ends_with("fixtures:/srv/fixtures"), "{bind}");
    assert!(calls.iter().any(|call| matches!(
        call,
        RuntimeCall::Build { labels, .. } if labels == &vec![String::from("berth.test-run=run-42")]
    )));
}

#[rstest]
fn missing_prefab_rejects_batch_before_runtime_calls() {
    let h = harness();
    let mut registry = Registry::new();
    let bare = NodeSpec::builder("bare").build();

    let err = h
        .lifecycle
        .launch(&mut registry, &[node("alpha"), bare])
        .expect_err("missing prefab");

    assert_eq!(
        err,
        LifecycleError::Node(NodeError::MissingPrefab {
            node: String::from("bare")
        })
    );
    assert!(registry.is_empty());
    assert_eq!(h.runtime.calls(), vec![RuntimeCall::Probe]);
}

#[rstest]
fn missing_base_image_is_a_node_error() {
    let h = harness();
    let mut registry = Registry::new();
    let empty = NodeSpec::builder("empty").empty_prefab().build();

    let err = h.lifecycle.launch(&mut registry, &[empty]).expect_err("no base image");

    assert!(matches!(err, LifecycleError::Node(NodeError::MissingBaseImage { .. })));
}

#[rstest]
fn duplicate_nodes_are_rejected() {
    let h = harness();
    let mut registry = Registry::new();

    let err = h
        .lifecycle
        .launch(&mut registry, &[node("alpha"), node("alpha")])
        .expect_err("duplicate");

    assert!(matches!(
        err,
        LifecycleError::Node(NodeError::Duplicate { ref node }) if node == "alpha"
    ));
    assert!(registry.is_empty());
}

#[rstest]
fn relaunching_a_registered_node_is_rejected() {
    let h = harness();
    let mut registry = launched(&h, &["alpha"]);

    let err = h
        .lifecycle
        .launch(&mut registry, &[node("alpha")])
        .expect_err("already launched");

    assert_eq!(
        err,
        LifecycleError::AlreadyLaunched {
            node: String::from("alpha")
        }
    );
    assert_eq!(registry.len(), 1);
}

#[rstest]
fn build_failure_only_fails_its_node() {
    let h = harness();
    h.runtime.fail_build_for("beta");
    let mut registry = Registry::new();

    let report = h
        .lifecycle
        .launch(&mut registry, &[node("alpha"), node("beta"), node("gamma")])
        .expect("siblings still launch");

    assert_eq!(report.launched, vec!["alpha", "gamma"]);
    assert!(matches!(
        report.failed.as_slice(),
        [NodeFailure { node, error: LifecycleError::Build { .. } }] if node == "beta"
    ));
    assert!(!registry.contains("beta"));
}

#[rstest]
fn fail_fast_stops_at_first_failure() {
    let h = harness();
    h.runtime.fail_run_for("beta");
    let mut registry = Registry::new();

    let err = h
        .lifecycle
        .launch(&mut registry, &[node("alpha"), node("beta"), node("gamma")])
        .expect_err("beta fails");

    assert!(matches!(
        err,
        LifecycleError::Runtime { ref node, ref operation, .. }
            if node == "beta" && operation == "run"
    ));
    assert_eq!(registry.nodes().collect::<Vec<_>>(), vec!["alpha"]);
    assert!(
        !h.runtime
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::Run { hostname, .. } if hostname == "gamma"))
    );
}

#[rstest]
fn isolated_policy_records_failures_and_continues() {
    let h = harness_with(LifecycleConfig {
        launch_policy: String::from("isolated"),
        ..lifecycle_config()
    });
    h.runtime.fail_run_for("beta");
    let mut registry = Registry::new();

    let report = h
        .lifecycle
        .launch(&mut registry, &[node("alpha"), node("beta"), node("gamma")])
        .expect("isolated launch");

    assert_eq!(report.launched, vec!["alpha", "gamma"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed.first().map(|f| f.node.as_str()), Some("beta"));
    assert!(!report.is_complete());
    assert_eq!(registry.len(), 2);
}

#[rstest]
fn failed_run_removes_the_built_image() {
    let h = harness();
    h.runtime.fail_run_for("alpha");
    let mut registry = Registry::new();

    let err = h.lifecycle.launch(&mut registry, &[node("alpha")]).expect_err("run fails");

    assert!(matches!(err, LifecycleError::Runtime { ref operation, .. } if operation == "run"));
    assert_eq!(h.runtime.count(|call| matches!(call, RuntimeCall::RemoveImage(_))), 1);
    assert!(registry.is_empty());
}

#[rstest]
fn failed_cleanup_is_noted_on_the_launch_error() {
    let h = harness();
    h.runtime.fail_run_for("alpha");
    h.runtime.fail_remove_image();
    let mut registry = Registry::new();

    let err = h.lifecycle.launch(&mut registry, &[node("alpha")]).expect_err("run fails");

    assert!(err.to_string().contains("cleanup also failed"), "{err}");
}

#[rstest]
fn empty_container_id_is_a_launch_failure() {
    let h = harness();
    h.runtime.set_container_id("");
    let mut registry = Registry::new();

    let err = h.lifecycle.launch(&mut registry, &[node("alpha")]).expect_err("empty id");

    assert!(matches!(err, LifecycleError::EmptyContainerId { ref node, .. } if node == "alpha"));
    assert!(registry.is_empty());
    assert_eq!(h.runtime.count(|call| matches!(call, RuntimeCall::RemoveImage(_))), 1);
}

#[rstest]
fn unavailable_runtime_skips_every_phase() {
    let h = harness();
    h.runtime.set_available(false);
    let mut registry = Registry::new();

    let report = h.lifecycle.launch(&mut registry, &[node("alpha")]).expect("skipped launch");
    h.lifecycle.connect(&mut registry).expect("skipped connect");
    let summary = h.lifecycle.teardown(&mut registry).expect("skipped teardown");

    assert!(report.skipped);
    assert!(registry.is_empty());
    assert_eq!(summary, TeardownSummary::default());
    assert_eq!(h.runtime.calls(), vec![RuntimeCall::Probe; 3]);
    assert!(h.ssh.calls().is_empty());
}

#[rstest]
fn interrupted_probe_fails_every_phase() {
    let h = harness();
    let mut registry = launched(&h, &["alpha"]);
    h.runtime.cancel_probe();

    let launch = h.lifecycle.launch(&mut registry, &[node("beta")]);
    let connect = h.lifecycle.connect(&mut registry);
    let teardown = h.lifecycle.teardown(&mut registry);

    assert!(matches!(launch, Err(LifecycleError::Interrupted { .. })));
    assert!(matches!(connect, Err(LifecycleError::Interrupted { .. })));
    assert!(matches!(teardown, Err(LifecycleError::Interrupted { .. })));
    assert_eq!(registry.len(), 1);
    assert!(h.ssh.calls().is_empty());
}

#[rstest]
fn connect_dials_the_mapped_loopback_port() {
    let h = harness();
    let registry = connected(&h, &["alpha"]);

    let expected = SshEndpoint {
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: STUB_MAPPED_PORT,
    };
    assert_eq!(h.ssh.calls(), vec![SshCall::Connect(expected)]);
    let session = registry.get("alpha").and_then(RegistryEntry::session).expect("session");
    assert_eq!(session.endpoint(), expected);
}

#[rstest]
fn unspecified_publish_address_dials_loopback() {
    let h = harness_with(LifecycleConfig {
        publish_address: String::from("0.0.0.0"),
        ..lifecycle_config()
    });
    let _registry = connected(&h, &["alpha"]);

    assert!(matches!(
        h.ssh.calls().first(),
        Some(SshCall::Connect(endpoint)) if endpoint.address == IpAddr::V4(Ipv4Addr::LOCALHOST)
    ));
}

#[rstest]
fn container_resolution_dials_container_address() {
    let h = harness_with(LifecycleConfig {
        host_resolution: String::from("container"),
        ..lifecycle_config()
    });
    let address = IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2));
    h.runtime.set_address(Some(address));
    let _registry = connected(&h, &["alpha"]);

    assert_eq!(
        h.ssh.calls(),
        vec![SshCall::Connect(SshEndpoint {
            address,
            port: SSH_PORT
        })]
    );
}

#[rstest]
fn connect_skips_nodes_already_connected() {
    let h = harness();
    let mut registry = connected(&h, &["alpha"]);

    h.lifecycle.connect(&mut registry).expect("second connect");

    assert_eq!(h.ssh.calls().len(), 1);
}

#[rstest]
fn stopped_container_cannot_be_connected() {
    let h = harness();
    h.runtime.set_running(false);
    let mut registry = launched(&h, &["alpha"]);

    let err = h.lifecycle.connect(&mut registry).expect_err("not running");

    assert_eq!(
        err,
        LifecycleError::NotRunning {
            node: String::from("alpha"),
            id: ContainerId::new(STUB_CONTAINER_ID),
        }
    );
    assert!(h.ssh.calls().is_empty());
}

#[rstest]
fn unmapped_port_cannot_be_connected() {
    let h = harness();
    h.runtime.set_mapped_port(None);
    let mut registry = launched(&h, &["alpha"]);

    let err = h.lifecycle.connect(&mut registry).expect_err("no port");

    assert!(matches!(err, LifecycleError::MissingPort { .. }));
}

#[rstest]
fn missing_container_address_cannot_be_connected() {
    let h = harness_with(LifecycleConfig {
        host_resolution: String::from("container"),
        ..lifecycle_config()
    });
    let mut registry = launched(&h, &["alpha"]);

    let err = h.lifecycle.connect(&mut registry).expect_err("no address");

    assert!(matches!(err, LifecycleError::MissingAddress { .. }));
}

#[rstest]
fn ssh_failure_names_the_node() {
    let h = harness();
    h.ssh.fail_connect();
    let mut registry = launched(&h, &["alpha"]);

    let err = h.lifecycle.connect(&mut registry).expect_err("auth fails");

    assert!(matches!(err, LifecycleError::Ssh { ref node, .. } if node == "alpha"));
    assert!(!registry.get("alpha").expect("alpha").is_connected());
}

#[rstest]
fn teardown_closes_sessions_and_destroys_resources() {
    let h = harness();
    let mut registry = connected(&h, &["alpha", "beta"]);

    let summary = h.lifecycle.teardown(&mut registry).expect("teardown");

    assert!(registry.is_empty());
    assert_eq!(summary.closed_sessions, 2);
    assert_eq!(summary.removed_containers, 2);
    assert_eq!(summary.removed_images, 2);
    assert_eq!(h.runtime.count(|call| matches!(call, RuntimeCall::Kill(_))), 2);
    assert_eq!(
        h.ssh
            .calls()
            .iter()
            .filter(|call| matches!(call, SshCall::Close(_)))
            .count(),
        2
    );
}

#[rstest]
fn teardown_without_destroy_keeps_everything() {
    let h = harness_with(LifecycleConfig {
        destroy: false,
        ..lifecycle_config()
    });
    let mut registry = connected(&h, &["alpha"]);

    let summary = h.lifecycle.teardown(&mut registry).expect("teardown");

    assert_eq!(summary.kept, vec!["alpha"]);
    assert_eq!(summary.closed_sessions, 1);
    assert_eq!(
        h.runtime.count(|call| matches!(
            call,
            RuntimeCall::Kill(_) | RuntimeCall::RemoveContainer(_) | RuntimeCall::RemoveImage(_)
        )),
        0
    );
}

#[rstest]
fn teardown_counts_only_sessions_that_closed() {
    let h = harness();
    let mut registry = connected(&h, &["alpha"]);
    h.ssh.fail_close();

    let summary = h.lifecycle.teardown(&mut registry).expect("teardown");

    assert!(registry.is_empty());
    assert_eq!(summary.closed_sessions, 0);
    assert_eq!(summary.removed_containers, 1);
}

#[rstest]
fn teardown_skips_entries_without_container() {
    let h = harness();
    let mut registry = Registry::new();
    registry.insert(
        "ghost",
        RegistryEntry::new(ContainerId::new(""), ImageName::new("berth-ghost-0")),
    );

    let summary = h.lifecycle.teardown(&mut registry).expect("teardown");

    assert_eq!(summary.skipped, vec!["ghost"]);
    assert_eq!(h.runtime.calls(), vec![RuntimeCall::Probe]);
}

#[rstest]
fn second_teardown_is_a_no_op() {
    let h = harness();
    let mut registry = launched(&h, &["alpha"]);
    h.lifecycle.teardown(&mut registry).expect("first teardown");
    h.runtime.clear_calls();

    let summary = h.lifecycle.teardown(&mut registry).expect("second teardown");

    assert_eq!(summary, TeardownSummary::default());
    assert_eq!(h.runtime.calls(), vec![RuntimeCall::Probe]);
}

#[rstest]
fn kill_failure_does_not_stop_removal() {
    let h = harness();
    h.runtime.fail_kill();
    let mut registry = launched(&h, &["alpha"]);

    let summary = h.lifecycle.teardown(&mut registry).expect("teardown");

    assert_eq!(summary.removed_containers, 1);
    assert_eq!(summary.removed_images, 1);
}

#[rstest]
fn removal_failures_are_collected_across_nodes() {
    let h = harness();
    h.runtime.fail_remove_container();
    let mut registry = launched(&h, &["alpha", "beta"]);

    let err = h.lifecycle.teardown(&mut registry).expect_err("rm fails");

    let LifecycleError::Teardown { failures } = err else {
        panic!("expected teardown error, got {err:?}");
    };
    assert_eq!(failures.len(), 2);
    assert!(registry.is_empty());
    assert_eq!(h.runtime.count(|call| matches!(call, RuntimeCall::RemoveImage(_))), 0);
}

#[rstest]
fn run_executes_over_the_session() {
    let h = harness();
    let registry = connected(&h, &["alpha"]);

    let output = h.lifecycle.run(&registry, "alpha", "uptime").expect("run");

    assert!(output.is_success());
    assert!(h.ssh.calls().iter().any(|call| matches!(
        call,
        SshCall::Exec { command, .. } if command == "uptime"
    )));
}

#[rstest]
fn run_reports_non_zero_exit_without_error() {
    let h = harness();
    h.ssh.set_exec_exit_code(Some(3));
    let registry = connected(&h, &["alpha"]);

    let output = h.lifecycle.run(&registry, "alpha", "false").expect("run");

    assert_eq!(output.exit_code, Some(3));
}

#[rstest]
fn run_requires_a_known_connected_node() {
    let h = harness();
    let registry = launched(&h, &["alpha"]);

    assert_eq!(
        h.lifecycle.run(&registry, "omega", "true"),
        Err(LifecycleError::UnknownNode {
            node: String::from("omega")
        })
    );
    assert_eq!(
        h.lifecycle.run(&registry, "alpha", "true"),
        Err(LifecycleError::NotConnected {
            node: String::from("alpha")
        })
    );
}

#[rstest]
#[case::moved(Some(0), true)]
#[case::move_failed(Some(1), false)]
fn transfer_stages_then_moves(#[case] exit_code: Option<i32>, #[case] expected: bool) {
    let h = harness();
    let registry = connected(&h, &["alpha"]);
    h.ssh.set_exec_exit_code(exit_code);

    let moved = h
        .lifecycle
        .transfer(&registry, "alpha", Utf8Path::new("fixtures/app"), "/opt/app")
        .expect("transfer");

    assert_eq!(moved, expected);
    let calls = h.ssh.calls();
    let staging = calls
        .iter()
        .find_map(|call| match call {
            SshCall::Upload { destination, .. } => Some(destination.clone()),
            _ => None,
        })
        .expect("upload recorded");
    assert!(staging.starts_with("/tmp/berth-"), "{staging}");
    assert!(calls.iter().any(|call| matches!(
        call,
        SshCall::Exec { command, .. } if command == &format!("mv {staging} /opt/app")
    )));
}

#[rstest]
fn failed_upload_is_an_error() {
    let h = harness();
    h.ssh.fail_upload();
    let registry = connected(&h, &["alpha"]);

    let err = h
        .lifecycle
        .transfer(&registry, "alpha", Utf8Path::new("fixtures"), "/opt")
        .expect_err("upload fails");

    assert!(matches!(err, LifecycleError::Ssh { .. }));
}

#[rstest]
fn docker_lifecycle_builds_from_config() {
    let lifecycle = DockerLifecycle::from_config(
        &lifecycle_config(),
        &docker_config(),
        ssh_config(),
        &CancellationToken::new(),
    )
    .expect("valid config");

    assert_eq!(lifecycle.settings().image_prefix, "berth");
    assert_eq!(PROVIDER_TYPE, "docker");
}

#[rstest]
fn docker_lifecycle_rejects_invalid_config() {
    let cfg = LifecycleConfig {
        host_resolution: String::from("bridge"),
        ..lifecycle_config()
    };

    let err = DockerLifecycle::from_config(
        &cfg,
        &docker_config(),
        ssh_config(),
        &CancellationToken::new(),
    )
    .expect_err("invalid resolution");

    assert!(matches!(err, LifecycleError::Config(_)));
}

#[rstest]
fn cancelled_docker_lifecycle_keeps_the_registry() {
    let token = CancellationToken::new();
    let lifecycle = DockerLifecycle::from_config(
        &lifecycle_config(),
        &docker_config(),
        ssh_config(),
        &token,
    )
    .expect("valid config");
    let mut registry = Registry::new();
    registry.insert(
        "web",
        RegistryEntry::new(ContainerId::new(STUB_CONTAINER_ID), ImageName::new("berth-web-0")),
    );
    token.cancel();

    let err = lifecycle.teardown(&mut registry).expect_err("cancelled teardown");

    assert!(
        matches!(
            err,
            LifecycleError::Interrupted {
                source: RuntimeError::Command(CommandError::Cancelled { .. })
            }
        ),
        "unexpected: {err}"
    );
    assert_eq!(registry.len(), 1);
}
