//! Test-run janitor for berth.
//!
//! This binary force-removes every container and image labelled
//! `berth.test-run=<BERTH_TEST_RUN_ID>` and then verifies none remain.

use std::io::Write as _;

use berth::janitor::{Janitor, JanitorConfig};
use berth::logging::init_logging;
use clap::Parser;

#[path = "../cli/mod.rs"]
mod cli;

use cli::Cli;

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    init_logging(&cli.log_filter).map_err(|err| err.to_string())?;

    let config =
        JanitorConfig::new(cli.test_run_id, cli.docker_bin).map_err(|err| err.to_string())?;
    let janitor = Janitor::with_docker(config);
    let summary = janitor.sweep().map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "janitor sweep complete: removed_containers={}, removed_images={}",
        summary.removed_containers,
        summary.removed_images
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}
