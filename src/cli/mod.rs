//! Command-line interface definitions for the `berth-janitor` binary.
//!
//! This module isolates the clap parser structures so the build script can
//! reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `berth-janitor` binary.
#[derive(Debug, Parser)]
#[command(
    name = "berth-janitor",
    about = "Remove containers and images leaked by a single berth test run"
)]
pub(crate) struct Cli {
    /// Test run id whose resources carry the `berth.test-run=<id>` label.
    #[arg(long, env = "BERTH_TEST_RUN_ID")]
    pub(crate) test_run_id: String,
    /// Path to the Docker CLI binary.
    #[arg(long, env = "BERTH_DOCKER_DOCKER_BIN", default_value = "docker")]
    pub(crate) docker_bin: String,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    pub(crate) log_filter: String,
}
