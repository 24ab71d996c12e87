mod calibration;
mod config;
mod control;
mod dist;
mod driver;
mod events;
mod input;
mod kernel;
mod manager;
mod model;
mod mutation;
mod records;
mod results;
mod scenario;
mod state;
mod stats;
mod testing;
mod tree;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    /// Directory holding config.toml, the data files and the runs.
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the replicate scenarios at the configured parameters.
    Simulate,

    /// Calibrate the parameters against the observed distances.
    Calibrate,

    /// Remove all run directories.
    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Simulate => mgr.simulate()?,
        Command::Calibrate => mgr.calibrate()?,
        Command::Clean => mgr.clean()?,
    }

    Ok(())
}
