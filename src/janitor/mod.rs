//! Leaked test-resource janitor.
//!
//! Lifecycles configured with a test run id label every image and container
//! they create with `berth.test-run=<id>`. The janitor finds resources carrying
//! that label after a crashed or interrupted run, force-removes them, and fails
//! if anything remains afterwards.

use thiserror::Error;
use tracing::info;

use crate::command::ProcessCommandRunner;
use crate::runtime::{
    ContainerRuntime, DEFAULT_DOCKER_BIN, DockerCli, Label, ResourceKind, RuntimeError,
};

/// Environment variable used by test harnesses to identify a test run.
pub const TEST_RUN_ID_ENV: &str = "BERTH_TEST_RUN_ID";

/// Label key applied to every resource created under a test run id.
pub const TEST_RUN_LABEL: &str = "berth.test-run";

/// Configuration for a janitor sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Test run identifier used to build the label filter.
    pub test_run_id: String,
    /// Path to the Docker CLI binary.
    pub docker_bin: String,
}

impl JanitorConfig {
    /// Constructs a config, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::InvalidConfig`] when any required field is blank.
    pub fn new(
        test_run_id: impl Into<String>,
        docker_bin: impl Into<String>,
    ) -> Result<Self, JanitorError> {
        let trimmed_test_run_id = test_run_id.into().trim().to_owned();
        let trimmed_docker_bin = docker_bin.into().trim().to_owned();
        if trimmed_test_run_id.is_empty() {
            return Err(JanitorError::InvalidConfig {
                field: String::from("test_run_id"),
            });
        }
        if trimmed_docker_bin.is_empty() {
            return Err(JanitorError::InvalidConfig {
                field: String::from("docker_bin"),
            });
        }
        Ok(Self {
            test_run_id: trimmed_test_run_id,
            docker_bin: trimmed_docker_bin,
        })
    }

    /// Constructs a config for the default Docker binary.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::InvalidConfig`] when `test_run_id` is blank.
    pub fn for_run(test_run_id: impl Into<String>) -> Result<Self, JanitorError> {
        Self::new(test_run_id, DEFAULT_DOCKER_BIN)
    }

    /// Returns the label identifying this test run's resources.
    #[must_use]
    pub fn label(&self) -> Label {
        Label::new(TEST_RUN_LABEL, self.test_run_id.as_str())
    }
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Number of containers removed during the sweep.
    pub removed_containers: usize,
    /// Number of images removed during the sweep.
    pub removed_images: usize,
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}")]
    InvalidConfig {
        /// Name of the missing or invalid field.
        field: String,
    },
    /// Raised when listing or removing resources fails.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Raised when resources remain after the sweep.
    #[error("resources remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
    },
}

/// Force-removes labelled containers and images for one test run.
#[derive(Clone, Debug)]
pub struct Janitor<C: ContainerRuntime> {
    config: JanitorConfig,
    runtime: C,
}

impl Janitor<DockerCli<ProcessCommandRunner>> {
    /// Creates a janitor that shells out to the configured Docker binary.
    #[must_use]
    pub fn with_docker(config: JanitorConfig) -> Self {
        let runtime = DockerCli::new(config.docker_bin.as_str(), ProcessCommandRunner::new());
        Self::new(config, runtime)
    }
}

impl<C: ContainerRuntime> Janitor<C> {
    /// Creates a new janitor over the provided runtime.
    #[must_use]
    pub const fn new(config: JanitorConfig, runtime: C) -> Self {
        Self { config, runtime }
    }

    /// Performs a sweep and returns how many resources were removed.
    ///
    /// Containers are removed first so that their images are no longer in
    /// use, then labelled images are removed. The sweep fails if any
    /// labelled resource remains at the end.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when the runtime fails or resources remain
    /// after removal attempts.
    pub fn sweep(&self) -> Result<SweepSummary, JanitorError> {
        let label = self.config.label();

        let mut summary = SweepSummary::default();
        for id in self.runtime.list_labelled(ResourceKind::Container, &label)? {
            info!(container = %id, "removing leaked container");
            self.runtime.force_remove(ResourceKind::Container, &id)?;
            summary.removed_containers += 1;
        }
        for id in self.runtime.list_labelled(ResourceKind::Image, &label)? {
            info!(image = %id, "removing leaked image");
            self.runtime.force_remove(ResourceKind::Image, &id)?;
            summary.removed_images += 1;
        }

        let remaining_containers = self.runtime.list_labelled(ResourceKind::Container, &label)?;
        let remaining_images = self.runtime.list_labelled(ResourceKind::Image, &label)?;
        if !remaining_containers.is_empty() || !remaining_images.is_empty() {
            let message = format!(
                "containers remaining: {}, images remaining: {}",
                remaining_containers.len(),
                remaining_images.len()
            );
            return Err(JanitorError::NotClean { message });
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests;
