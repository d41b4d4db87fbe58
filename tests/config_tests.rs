//! Configuration loading through the environment layer.

use berth::config::{ConfigError, DockerConfig, HostResolution, LaunchPolicy, LifecycleConfig};
use berth::ssh::SshConfig;
use berth::test_support::EnvGuard;

#[tokio::test]
async fn defaults_load_without_any_source() {
    let _guard = EnvGuard::remove_vars(&[
        "BERTH_DESTROY",
        "BERTH_LAUNCH_POLICY",
        "BERTH_HOST_RESOLUTION",
        "BERTH_TEST_RUN_ID",
    ])
    .await;

    let settings = LifecycleConfig::load_without_cli_args()
        .and_then(|cfg| cfg.validate())
        .unwrap_or_else(|err| panic!("defaults should load: {err}"));

    assert!(settings.destroy);
    assert_eq!(settings.launch_policy, LaunchPolicy::FailFast);
    assert_eq!(settings.host_resolution, HostResolution::Loopback);
    assert_eq!(settings.test_run_id, None);
}

#[tokio::test]
async fn environment_overrides_lifecycle_policies() {
    let _guard = EnvGuard::set_vars(&[
        ("BERTH_DESTROY", "false"),
        ("BERTH_LAUNCH_POLICY", "isolated"),
        ("BERTH_HOST_RESOLUTION", "container"),
        ("BERTH_TEST_RUN_ID", "ci-1234"),
    ])
    .await;

    let settings = LifecycleConfig::load_without_cli_args()
        .and_then(|cfg| cfg.validate())
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert!(!settings.destroy);
    assert_eq!(settings.launch_policy, LaunchPolicy::Isolated);
    assert_eq!(settings.host_resolution, HostResolution::Container);
    assert_eq!(settings.test_run_id.as_deref(), Some("ci-1234"));
}

#[tokio::test]
async fn invalid_policy_from_environment_is_actionable() {
    let _guard = EnvGuard::set_vars(&[("BERTH_LAUNCH_POLICY", "parallel")]).await;

    let cfg = LifecycleConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));
    let error = cfg.validate().expect_err("unknown policy");

    let ConfigError::InvalidValue(ref message) = error else {
        panic!("expected InvalidValue error, got {error:?}");
    };
    assert!(message.contains("BERTH_LAUNCH_POLICY"), "{message}");
    assert!(message.contains("launch_policy"), "{message}");
}

#[tokio::test]
async fn docker_binary_comes_from_environment() {
    let _guard = EnvGuard::set_vars(&[
        ("BERTH_DOCKER_DOCKER_BIN", "/usr/local/bin/podman"),
        ("BERTH_DOCKER_COMMAND_TIMEOUT_SECS", "60"),
    ])
    .await;

    let cfg = DockerConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("docker config should load: {err}"));

    assert_eq!(cfg.docker_bin, "/usr/local/bin/podman");
    assert_eq!(cfg.command_timeout_secs, 60);
}

#[tokio::test]
async fn ssh_settings_come_from_environment() {
    let _guard = EnvGuard::set_vars(&[
        ("BERTH_SSH_USER", "fixture"),
        ("BERTH_SSH_PASSWORD", "s3cret"),
    ])
    .await;

    let cfg = SshConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("ssh config should load: {err}"));

    assert_eq!(cfg.user, "fixture");
    assert_eq!(cfg.bootstrap().root_password(), "s3cret");
    assert_eq!(cfg.validate(), Ok(()));
}
