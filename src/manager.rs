use crate::calibration::{ChainResults, run_chain};
use crate::config::{Config, Params};
use crate::input::Landscape;
use crate::results::{ScenarioResults, Summary};
use crate::scenario::run_replicates;
use anyhow::{Context, Result};
use glob::glob;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::encode;
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
    landscape: Landscape,
}

/// Everything written by one `simulate` run.
#[derive(Debug, Serialize)]
struct SimulationOutput<'a> {
    seed: u64,
    params: Params,
    summary: &'a Summary,
    scenarios: &'a [ScenarioResults],
}

/// Everything written by one `calibrate` run.
#[derive(Debug, Serialize)]
struct CalibrationOutput<'a> {
    seed: u64,
    chain: &'a ChainResults,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        let landscape = Landscape::load(&sim_dir, &cfg).context("failed to load landscape")?;

        Ok(Self {
            sim_dir,
            cfg,
            landscape,
        })
    }

    /// Run the replicates at the configured parameters into a new run dir.
    pub fn simulate(&self) -> Result<()> {
        let run_dir = self.create_run_dir()?;
        let seed = self.master_seed()?;
        log::info!("master seed {seed}");

        let params = self.cfg.model;
        let scenarios = run_replicates(&self.landscape, &self.cfg, params, seed)
            .context("failed to run scenarios")?;
        let summary = Summary::join(&scenarios);
        log::info!(
            "log-likelihood {:.4} ({} of {} scores rejected, {} contained)",
            summary.log_likelihood,
            summary.n_rejected_scores,
            summary.n_scenarios,
            summary.n_contained
        );

        let output = SimulationOutput {
            seed,
            params,
            summary: &summary,
            scenarios: &scenarios,
        };
        write_msgpack(run_dir.join("results.msgpack"), &output)
            .context("failed to save results")?;

        Ok(())
    }

    /// Run the calibration chain into a new run dir.
    pub fn calibrate(&self) -> Result<()> {
        let calibration = self
            .cfg
            .calibration
            .as_ref()
            .context("config has no calibration section")?;

        let run_dir = self.create_run_dir()?;
        let seed = self.master_seed()?;
        log::info!("master seed {seed}");

        let chain = run_chain(&self.landscape, &self.cfg, calibration, seed)
            .context("failed to run calibration chain")?;
        log::info!("last accepted params {:#?}", chain.params);

        let output = CalibrationOutput {
            seed,
            chain: &chain,
        };
        write_msgpack(run_dir.join("chain.msgpack"), &output).context("failed to save chain")?;

        Ok(())
    }

    /// Remove every run dir.
    pub fn clean(&self) -> Result<()> {
        for run_dir in self.run_dirs()? {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }
        Ok(())
    }

    fn master_seed(&self) -> Result<u64> {
        match self.cfg.simulation.seed {
            Some(seed) => Ok(seed),
            None => {
                let mut rng = ChaCha12Rng::try_from_os_rng().context("failed to seed from os")?;
                Ok(rng.random())
            }
        }
    }

    fn create_run_dir(&self) -> Result<PathBuf> {
        let run_idx = self.run_dirs().context("failed to count run dirs")?.len();

        let run_dir = self.sim_dir.join(format!("run-{run_idx:04}"));
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        Ok(run_dir)
    }

    fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let run_dirs = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        Ok(run_dirs)
    }
}

fn write_msgpack<P: AsRef<Path>, T: Serialize>(file: P, value: &T) -> Result<()> {
    let file = file.as_ref();
    let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    let mut writer = BufWriter::new(file);
    encode::write_named(&mut writer, value).context("failed to serialize output")?;
    writer.flush().context("failed to flush writer stream")?;
    Ok(())
}
