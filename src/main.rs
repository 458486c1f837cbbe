//! # ci-replay CLI
//!
//! Binary entry point for the `ci-replay` command-line tool.
//!
//! Its responsibilities are parsing command-line arguments with `clap`,
//! dispatching to the selected command, and translating the run outcome into
//! the process exit status. The engine itself lives in the library crate.

mod cli;
mod commands;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<ExitCode> {
    let cli = cli::Cli::parse();
    cli.execute()
}
