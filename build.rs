//! Build script rendering the `berth-janitor` man page into `OUT_DIR`.

use std::env;
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(stdout, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or("OUT_DIR was not set")?;

    let command = cli::Cli::command();
    let page = out_dir.join(format!("{}.1", command.get_name()));
    let mut buffer = Vec::new();
    Man::new(command).render(&mut buffer)?;
    fs::write(page, buffer)?;

    Ok(())
}
