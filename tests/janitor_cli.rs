//! Behavioural smoke tests for the `berth-janitor` binary.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn help_lists_the_sweep_options() {
    let mut cmd = cargo_bin_cmd!("berth-janitor");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--test-run-id")
                .and(predicate::str::contains("--docker-bin")),
        );
}

#[test]
fn missing_test_run_id_is_a_usage_error() {
    let mut cmd = cargo_bin_cmd!("berth-janitor");
    cmd.env_remove("BERTH_TEST_RUN_ID")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--test-run-id"));
}

#[test]
fn blank_test_run_id_is_rejected() {
    let mut cmd = cargo_bin_cmd!("berth-janitor");
    cmd.args(["--test-run-id", "  "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing test_run_id"));
}

#[test]
fn unreachable_docker_binary_fails_the_sweep() {
    let mut cmd = cargo_bin_cmd!("berth-janitor");
    cmd.args(["--test-run-id", "run-1", "--docker-bin", "/nonexistent/berth-docker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/berth-docker"));
}
