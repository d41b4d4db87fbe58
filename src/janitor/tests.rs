//! Unit tests for the janitor module.

use super::*;
use crate::command::CommandInvocation;
use crate::test_support::{RecordingRuntime, RuntimeCall, ScriptedRunner, json_lines};
use rstest::rstest;

#[rstest]
fn janitor_config_builds_label() {
    let cfg = JanitorConfig::for_run(" abc ").expect("config should build");
    assert_eq!(cfg.label().pair(), "berth.test-run=abc");
    assert_eq!(cfg.docker_bin, DEFAULT_DOCKER_BIN);
}

#[rstest]
#[case("test_run_id", " ", DEFAULT_DOCKER_BIN)]
#[case("docker_bin", "run-1", "  ")]
fn janitor_config_rejects_blank_fields(
    #[case] expected_field: &str,
    #[case] test_run_id: &str,
    #[case] docker_bin: &str,
) {
    let err = JanitorConfig::new(test_run_id, docker_bin).expect_err("expected invalid config");
    assert_eq!(
        err,
        JanitorError::InvalidConfig {
            field: expected_field.to_owned()
        }
    );
}

#[rstest]
fn sweep_removes_containers_before_images() {
    let runtime = RecordingRuntime::new();
    runtime.add_labelled(ResourceKind::Container, "c-1");
    runtime.add_labelled(ResourceKind::Container, "c-2");
    runtime.add_labelled(ResourceKind::Image, "sha256:i-1");
    let janitor = Janitor::new(JanitorConfig::for_run("run-1").expect("config"), runtime.clone());

    let summary = janitor.sweep().expect("sweep should succeed");

    assert_eq!(
        summary,
        SweepSummary {
            removed_containers: 2,
            removed_images: 1
        }
    );
    let label = String::from("berth.test-run=run-1");
    assert_eq!(
        runtime.calls(),
        vec![
            RuntimeCall::List(ResourceKind::Container, label.clone()),
            RuntimeCall::ForceRemove(ResourceKind::Container, String::from("c-1")),
            RuntimeCall::ForceRemove(ResourceKind::Container, String::from("c-2")),
            RuntimeCall::List(ResourceKind::Image, label.clone()),
            RuntimeCall::ForceRemove(ResourceKind::Image, String::from("sha256:i-1")),
            RuntimeCall::List(ResourceKind::Container, label.clone()),
            RuntimeCall::List(ResourceKind::Image, label),
        ]
    );
}

#[rstest]
fn sweep_with_nothing_labelled_is_clean() {
    let runtime = RecordingRuntime::new();
    let janitor = Janitor::new(JanitorConfig::for_run("run-1").expect("config"), runtime);

    assert_eq!(janitor.sweep(), Ok(SweepSummary::default()));
}

#[rstest]
fn sweep_fails_when_resources_remain() {
    let runtime = RecordingRuntime::new();
    runtime.add_labelled(ResourceKind::Image, "sha256:stuck");
    runtime.keep_labelled();
    let janitor = Janitor::new(JanitorConfig::for_run("run-1").expect("config"), runtime);

    let err = janitor.sweep().expect_err("sweep should fail");

    assert_eq!(
        err,
        JanitorError::NotClean {
            message: String::from("containers remaining: 0, images remaining: 1")
        }
    );
}

#[rstest]
fn sweep_drives_the_docker_cli() {
    let runner = ScriptedRunner::new();
    // ps (pre)
    runner.push_output(Some(0), json_lines(&["c-1"]), "");
    // rm --force c-1
    runner.push_success();
    // images (pre)
    runner.push_output(Some(0), "", "");
    // ps (post)
    runner.push_output(Some(0), "", "");
    // images (post)
    runner.push_output(Some(0), "", "");
    let config = JanitorConfig::new("run-1", "/usr/local/bin/docker").expect("config");
    let janitor = Janitor::new(config, DockerCli::new("/usr/local/bin/docker", runner.clone()));

    let summary = janitor.sweep().expect("sweep should succeed");

    assert_eq!(summary.removed_containers, 1);
    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 5);
    assert!(
        invocations
            .iter()
            .all(|invocation| invocation.program == "/usr/local/bin/docker")
    );
    assert_eq!(
        invocations.get(1).map(CommandInvocation::command_string).as_deref(),
        Some("/usr/local/bin/docker rm --force c-1")
    );
}

#[rstest]
fn sweep_propagates_runtime_failures() {
    let runner = ScriptedRunner::new();
    runner.push_failure(1);
    let janitor = Janitor::new(
        JanitorConfig::for_run("run-1").expect("config"),
        DockerCli::new(DEFAULT_DOCKER_BIN, runner),
    );

    let err = janitor.sweep().expect_err("listing fails");

    assert!(matches!(err, JanitorError::Runtime(RuntimeError::CommandFailure { .. })));
}
