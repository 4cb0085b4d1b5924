//! # swt-build: The Main Entry Point
//!
//! Builds `StartWaitTree.exe` and `StartWaitTree_Admin.exe` with the Visual C++ 2005
//! toolchain and the Windows 2000 Platform SDK, then sets the ASLR and high-entropy
//! VA bits that this linker cannot set by itself.
//!
//! Run without arguments from the build directory. Exits with 0 on success and 1
//! on the first failure, after printing the failure once.

use std::path::PathBuf;
use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use simplelog::{Config, SimpleLogger};

mod environment;
mod error;
#[cfg(test)]
mod log_capture;
mod manifest;
mod pe;
mod pipeline;
mod system;
mod toolchain;

use pipeline::{BuildPlan, run_build};
use system::{HostSystem, SystemOps};

#[derive(Parser)]
#[command(name = "swt-build")]
#[command(about = "Builds StartWaitTree (standard and admin) and hardens the executables", long_about = None)]
struct Cli {
    /// Directory the artifacts are written to. Sources and manifests are read from its parent.
    #[arg(short = 'C', long, default_value = ".")]
    dir: PathBuf,

    /// Print the build plan as JSON and exit without building.
    #[arg(long)]
    dry_run: bool,

    /// Turn on logging.
    ///
    /// - `-v`: Info
    /// - `-vv`: Debug
    /// - `-vvv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn run(cli: &Cli, system: &impl SystemOps) -> Result<()> {
    let plan = BuildPlan::standard(&cli.dir);

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    run_build(system, &plan)?;
    Ok(())
}

/// Prints the error, if any, and maps the result to the process exit code.
fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            println!("{:#}", e);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Logging failure shouldn't stop the build.
    let _ = SimpleLogger::init(log_level(cli.verbose), Config::default());

    let result = run(&cli, &HostSystem);
    std::process::exit(exit_code(&result));
}
