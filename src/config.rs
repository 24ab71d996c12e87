use crate::model::Species;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path, path::PathBuf};

/// Simulation configuration.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub simulation: SimulationConfig,
    pub model: Params,
    pub control: ControlConfig,
    pub seeding: SeedingConfig,
    pub inputs: InputConfig,
    pub calibration: Option<CalibrationConfig>,
}

/// Time frame and replicate settings. Dates are days since the zero date.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    pub start_date: i32,
    pub end_date: i32,
    /// Length of one step in days.
    pub step_size: i32,
    /// Calendar year of day zero.
    pub zero_year: i32,
    /// Master seed; drawn from the OS when absent.
    pub seed: Option<u64>,
    /// Replicate scenarios per parameter set.
    pub n_scenarios: usize,
    /// Rerun scenarios whose outbreak dies out before the end date.
    #[serde(default)]
    pub filter_short_epidemics: bool,
    /// Upper bound on reruns; unbounded when absent.
    pub max_resample_attempts: Option<usize>,
    pub max_infected_cows: usize,
    pub max_infected_badgers: usize,
}

/// Parameters of the transmission model.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    pub beta_cc: f64,
    pub beta_cb: f64,
    pub beta_bc: f64,
    pub beta_bb: f64,
    /// Exposed to test-sensitive rate per day.
    pub sigma: f64,
    /// Test-sensitive to infectious rate per day.
    pub gamma: f64,
    /// SNPs per lineage per day.
    pub mutation_rate: f64,
    pub test_sensitivity: f64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamName {
    BetaCc,
    BetaCb,
    BetaBc,
    BetaBb,
    Sigma,
    Gamma,
    MutationRate,
    TestSensitivity,
}

impl Params {
    pub fn get(&self, name: ParamName) -> f64 {
        match name {
            ParamName::BetaCc => self.beta_cc,
            ParamName::BetaCb => self.beta_cb,
            ParamName::BetaBc => self.beta_bc,
            ParamName::BetaBb => self.beta_bb,
            ParamName::Sigma => self.sigma,
            ParamName::Gamma => self.gamma,
            ParamName::MutationRate => self.mutation_rate,
            ParamName::TestSensitivity => self.test_sensitivity,
        }
    }

    pub fn set(&mut self, name: ParamName, value: f64) {
        let slot = match name {
            ParamName::BetaCc => &mut self.beta_cc,
            ParamName::BetaCb => &mut self.beta_cb,
            ParamName::BetaBc => &mut self.beta_bc,
            ParamName::BetaBb => &mut self.beta_bb,
            ParamName::Sigma => &mut self.sigma,
            ParamName::Gamma => &mut self.gamma,
            ParamName::MutationRate => &mut self.mutation_rate,
            ParamName::TestSensitivity => &mut self.test_sensitivity,
        };
        *slot = value;
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("beta_cc", self.beta_cc),
            ("beta_cb", self.beta_cb),
            ("beta_bc", self.beta_bc),
            ("beta_bb", self.beta_bb),
            ("sigma", self.sigma),
            ("gamma", self.gamma),
            ("mutation_rate", self.mutation_rate),
        ] {
            check_num(value, 0.0..f64::INFINITY).with_context(|| format!("invalid {name}"))?;
        }
        check_num(self.test_sensitivity, 0.0..=1.0).context("invalid test sensitivity")?;
        Ok(())
    }
}

/// Herd management and movement settings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    pub test_interval_years: f64,
    pub n_initially_restricted: usize,
    pub herd_size_fixed: bool,
    pub reservoir_size_fixed: bool,
    pub include_reservoir: bool,
    /// Annual death probability of a badger.
    pub badger_death_rate: f64,
    /// Whether tests of moving badgers can capture a sample.
    #[serde(default)]
    pub capture_badgers_on_move: bool,
    /// Window covered by the movement data, in days since the zero date.
    pub movement_start_date: i32,
    pub movement_end_date: i32,
}

/// Initial infections.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedingConfig {
    /// `id:unit:clade:p1,p2,...` entries separated by `;`.
    pub initial_infection_states: String,
    /// Founder SNPs generated per clade.
    pub init_mutations_per_clade: i32,
    #[serde(default)]
    pub init_badgers_from_cows: bool,
}

/// Data files, relative to the simulation directory.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub farms: PathBuf,
    pub reservoirs: PathBuf,
    pub reservoir_locations: PathBuf,
    pub cattle_movements: PathBuf,
    pub badger_movements: PathBuf,
    pub herd_sizes: PathBuf,
    pub reservoir_sizes: PathBuf,
    pub slaughter_schedule: PathBuf,
    pub cattle_sampling_rates: PathBuf,
    pub badger_sampling_rates: PathBuf,
    pub observed_distances: PathBuf,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    pub n_steps: usize,
    /// Divides the log-likelihood difference in the acceptance test.
    pub smoothing_ratio: f64,
    pub priors: Vec<Prior>,
}

/// Uniform prior over one calibrated parameter.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prior {
    pub name: ParamName,
    pub min: f64,
    pub max: f64,
    pub initial: f64,
    /// Standard deviation of the random-walk proposal.
    pub std_dev: f64,
}

/// Cow and badger compartments that a seed may start in.
const COW_SEED_STATES: usize = 4;
const BADGER_SEED_STATES: usize = 2;

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to open {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulation;
        if sim.start_date > sim.end_date {
            bail!(
                "start date {} is after end date {}",
                sim.start_date,
                sim.end_date
            );
        }
        check_num(sim.step_size, 1..=365).context("invalid step size")?;
        check_num(sim.n_scenarios, 1..100_000).context("invalid number of scenarios")?;
        check_num(sim.max_infected_cows, 1..).context("invalid maximum of infected cows")?;
        check_num(sim.max_infected_badgers, 1..).context("invalid maximum of infected badgers")?;

        self.model.validate().context("invalid model parameters")?;

        let control = &self.control;
        check_num(control.test_interval_years, 0.0..100.0).context("invalid test interval")?;
        check_num(control.badger_death_rate, 0.0..=1.0).context("invalid badger death rate")?;
        if control.movement_start_date >= control.movement_end_date {
            bail!(
                "movement start date {} must precede movement end date {}",
                control.movement_start_date,
                control.movement_end_date
            );
        }

        check_seeds(&self.seeding.initial_infection_states)
            .context("invalid initial infection states")?;
        check_num(self.seeding.init_mutations_per_clade, 0..10_000)
            .context("invalid number of founder mutations")?;

        if let Some(calibration) = &self.calibration {
            calibration
                .validate()
                .context("invalid calibration settings")?;
        }

        Ok(())
    }

    /// Badger death probability over one step.
    pub fn badger_death_prob(&self) -> f64 {
        self.control.badger_death_rate * self.simulation.step_size as f64 / 365.0
    }
}

impl CalibrationConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.n_steps, 1..1_000_000).context("invalid number of steps")?;
        check_num(self.smoothing_ratio, f64::MIN_POSITIVE..f64::INFINITY)
            .context("invalid smoothing ratio")?;
        if self.priors.is_empty() {
            bail!("at least one prior is required");
        }
        for prior in &self.priors {
            if prior.min > prior.max {
                bail!("prior of {:?} has min {} above max {}", prior.name, prior.min, prior.max);
            }
            check_num(prior.initial, prior.min..=prior.max).with_context(|| {
                format!("initial value of {:?} is outside its prior", prior.name)
            })?;
            check_num(prior.std_dev, 0.0..f64::INFINITY)
                .with_context(|| format!("invalid proposal width of {:?}", prior.name))?;
        }
        Ok(())
    }
}

/// A parsed `id:unit:clade:probabilities` seed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedSpec {
    pub species: Species,
    pub animal_id: String,
    pub unit_id: String,
    pub clade: String,
    pub probs: Vec<f64>,
}

pub fn parse_seeds(seeds: &str) -> Result<Vec<SeedSpec>> {
    let mut specs = Vec::new();
    for entry in seeds.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
        let &[animal_id, unit_id, clade, probs] = fields.as_slice() else {
            bail!("seed entry {entry:?} must have 4 fields");
        };
        let species = match animal_id.split('_').next() {
            Some("Cow") => Species::Cow,
            Some("Badger") => Species::Badger,
            _ => bail!("seed {animal_id:?} is neither a Cow_ nor a Badger_"),
        };
        let probs = probs
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to parse probabilities of {entry:?}"))?;
        specs.push(SeedSpec {
            species,
            animal_id: animal_id.to_string(),
            unit_id: unit_id.to_string(),
            clade: clade.to_string(),
            probs,
        });
    }
    Ok(specs)
}

fn check_seeds(seeds: &str) -> Result<()> {
    let specs = parse_seeds(seeds)?;
    if specs.is_empty() {
        bail!("at least one seed is required");
    }
    let mut can_infect = false;
    for spec in &specs {
        let n_states = match spec.species {
            Species::Cow => COW_SEED_STATES,
            Species::Badger => BADGER_SEED_STATES,
        };
        check_vec(&spec.probs, n_states)
            .with_context(|| format!("invalid probabilities of {}", spec.animal_id))?;
        can_infect |= spec.probs[1..].iter().any(|&p| p > 0.0);
    }
    if !can_infect {
        bail!("no seed can start infected");
    }
    Ok(())
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_vec(vec: &[f64], exp_len: usize) -> Result<()> {
    let len = vec.len();
    if len != exp_len {
        bail!("vector length must be {exp_len}, but is {len}");
    }
    if vec.iter().any(|&ele| ele < 0.0) {
        bail!("vector must have only non-negative elements");
    }
    let sum: f64 = vec.iter().sum();
    let tol = 1e-8;
    if (sum - 1.0).abs() > tol {
        bail!("vector must sum to 1.0 (tolerance: {tol}), but sums to {sum}");
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn sample_config() -> Config {
        Config {
            simulation: SimulationConfig {
                start_date: 0,
                end_date: 365,
                step_size: 1,
                zero_year: 2000,
                seed: Some(42),
                n_scenarios: 2,
                filter_short_epidemics: false,
                max_resample_attempts: None,
                max_infected_cows: 1_000,
                max_infected_badgers: 1_000,
            },
            model: Params {
                beta_cc: 0.1,
                beta_cb: 0.0,
                beta_bc: 0.0,
                beta_bb: 0.0,
                sigma: 0.01,
                gamma: 0.01,
                mutation_rate: 0.001,
                test_sensitivity: 1.0,
            },
            control: ControlConfig {
                test_interval_years: 99.0,
                n_initially_restricted: 0,
                herd_size_fixed: true,
                reservoir_size_fixed: true,
                include_reservoir: false,
                badger_death_rate: 0.0,
                capture_badgers_on_move: false,
                movement_start_date: 0,
                movement_end_date: 365,
            },
            seeding: SeedingConfig {
                initial_infection_states: "Cow_1:F1:A:0,0,0,1".to_string(),
                init_mutations_per_clade: 3,
                init_badgers_from_cows: false,
            },
            inputs: InputConfig {
                farms: "farms.csv".into(),
                reservoirs: "reservoirs.csv".into(),
                reservoir_locations: "reservoir_locations.txt".into(),
                cattle_movements: "cattle_movements.txt".into(),
                badger_movements: "badger_movements.txt".into(),
                herd_sizes: "herd_sizes.txt".into(),
                reservoir_sizes: "reservoir_sizes.txt".into(),
                slaughter_schedule: "slaughter.txt".into(),
                cattle_sampling_rates: "cattle_sampling.csv".into(),
                badger_sampling_rates: "badger_sampling.csv".into(),
                observed_distances: "observed_distances.txt".into(),
            },
            calibration: None,
        }
    }

    #[test]
    fn sample_config_is_valid() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn start_after_end_is_rejected() {
        let mut cfg = sample_config();
        cfg.simulation.start_date = 400;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn prior_initial_outside_bounds_is_rejected() {
        let mut cfg = sample_config();
        cfg.calibration = Some(CalibrationConfig {
            n_steps: 10,
            smoothing_ratio: 1.0,
            priors: vec![Prior {
                name: ParamName::BetaCc,
                min: 0.0,
                max: 0.5,
                initial: 0.7,
                std_dev: 0.05,
            }],
        });
        assert!(cfg.validate().is_err());

        if let Some(calibration) = cfg.calibration.as_mut() {
            calibration.priors[0].initial = 0.2;
        }
        cfg.validate().unwrap();
    }

    #[test]
    fn seeds_are_parsed_and_checked() {
        let specs = parse_seeds("Cow_1:F1:A:0,0.5,0,0.5; Badger_1:R1:B:0.5,0.5").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].species, Species::Cow);
        assert_eq!(specs[1].species, Species::Badger);
        assert_eq!(specs[1].unit_id, "R1");
        assert_eq!(specs[1].probs, vec![0.5, 0.5]);

        assert!(check_seeds("Cow_1:F1:A:1,0,0,0").is_err());
        assert!(check_seeds("Cow_1:F1:A:0,1").is_err());
        assert!(check_seeds("Cow_1:F1:0,0,0,1").is_err());
        assert!(check_seeds("Sheep_1:F1:A:0,0,0,1").is_err());
    }

    #[test]
    fn params_are_addressable_by_name() {
        let mut params = sample_config().model;
        params.set(ParamName::Gamma, 0.25);
        assert_eq!(params.get(ParamName::Gamma), 0.25);
        assert_eq!(params.get(ParamName::BetaCc), 0.1);
    }
}
