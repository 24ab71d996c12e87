use crate::config::{Config, Params, SeedSpec, parse_seeds};
use crate::dist::IntegerDistribution;
use crate::driver::{StochasticDriver, TauLeapFixedStep};
use crate::input::{Landscape, UnitTemplate};
use crate::kernel::TransitionKernel;
use crate::model::{Animal, CowState, Disease, Farm, Reservoir, Species, TestState};
use crate::records::{InitialRestrictionRecord, InitialSizeRecord, InitialStateRecord};
use crate::results::{Outcome, ScenarioResults, score};
use crate::state::State;
use crate::tree::{ROOT_ID, TreeNode};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::weighted::WeightedIndex;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Days between a breakdown and the follow-up herd test.
pub const FOLLOW_UP_DAYS: i32 = 60;

/// One replicate outbreak.
///
/// Reads the shared landscape and configuration and owns everything it
/// mutates, so replicates can run on separate threads.
pub struct Scenario<'a> {
    pub(crate) landscape: &'a Landscape,
    pub(crate) cfg: &'a Config,
    pub(crate) params: Params,
    pub(crate) rng: ChaCha12Rng,
    pub(crate) state: State,
}

impl<'a> Scenario<'a> {
    pub fn new(landscape: &'a Landscape, cfg: &'a Config, params: Params, seed: u64) -> Self {
        Self {
            landscape,
            cfg,
            params,
            rng: ChaCha12Rng::seed_from_u64(seed),
            state: State::default(),
        }
    }

    /// Run the scenario to completion and score it.
    ///
    /// With short-epidemic filtering on, runs whose outbreak dies out
    /// early are discarded and restarted.
    pub fn run(mut self) -> Result<ScenarioResults> {
        let cfg = self.cfg;
        let sim = &cfg.simulation;
        let mut n_rejected_runs = 0;
        let outcome = loop {
            self.initialise().context("failed to initialise scenario")?;
            let outcome = self.simulate().context("failed to simulate scenario")?;
            if !(sim.filter_short_epidemics && outcome == Outcome::Contained) {
                break outcome;
            }
            n_rejected_runs += 1;
            if let Some(max_attempts) = sim.max_resample_attempts
                && n_rejected_runs >= max_attempts
            {
                log::warn!("keeping contained outbreak after {n_rejected_runs} reruns");
                break outcome;
            }
            log::debug!("outbreak contained early, rerunning ({n_rejected_runs})");
        };

        self.results(outcome, n_rejected_runs)
    }

    pub(crate) fn initialise(&mut self) -> Result<()> {
        self.state = State::default();
        let start = self.cfg.simulation.start_date;

        self.initialise_farms().context("failed to initialise farms")?;
        self.initialise_reservoirs()
            .context("failed to initialise reservoirs")?;
        self.initialise_restrictions();

        let seeds = parse_seeds(&self.cfg.seeding.initial_infection_states)
            .context("failed to parse initial infection states")?;
        let mut n_seeded = 0;
        while n_seeded == 0 {
            self.state.records.initial_states.clear();
            n_seeded = self
                .seed_infections(&seeds, start)
                .context("failed to seed infections")?;
        }
        log::debug!("seeded {n_seeded} infections");

        Ok(())
    }

    fn initialise_farms(&mut self) -> Result<()> {
        let landscape = self.landscape;
        let fixed = self.cfg.control.herd_size_fixed;
        for (id, template) in &landscape.farms {
            let size = landscape
                .herd_sizes
                .random_bin(&mut self.rng)
                .context("herd size distribution is empty")?;
            let farm = Farm {
                id: id.clone(),
                size,
                off_movement: off_movement_for(template, size, fixed),
                test_state: TestState::Free { last_clear_test: 0 },
                reservoirs: template.connections.clone(),
                infected: BTreeSet::new(),
            };
            self.record_initial_size(Species::Cow, id, size);
            self.state.pop.farms.insert(id.clone(), farm);
        }
        Ok(())
    }

    fn initialise_reservoirs(&mut self) -> Result<()> {
        let landscape = self.landscape;
        let fixed = self.cfg.control.reservoir_size_fixed;
        for (id, template) in &landscape.reservoirs {
            let size = landscape
                .reservoir_sizes
                .random_bin(&mut self.rng)
                .context("reservoir size distribution is empty")?;
            let reservoir = Reservoir {
                id: id.clone(),
                size,
                off_movement: off_movement_for(template, size, fixed),
                farms: template.connections.clone(),
                infected: BTreeSet::new(),
            };
            self.record_initial_size(Species::Badger, id, size);
            self.state.pop.reservoirs.insert(id.clone(), reservoir);
        }
        Ok(())
    }

    fn record_initial_size(&mut self, species: Species, unit_id: &str, size: u32) {
        self.state.records.initial_sizes.push(InitialSizeRecord {
            species,
            unit_id: unit_id.to_string(),
            size,
        });
    }

    /// Put some herds under restriction and spread the last routine test
    /// of the others over the preceding test interval.
    fn initialise_restrictions(&mut self) {
        let start = self.cfg.simulation.start_date;
        let ids: Vec<String> = self.state.pop.farms.keys().cloned().collect();
        let restricted: BTreeSet<String> = ids
            .choose_multiple(&mut self.rng, self.cfg.control.n_initially_restricted)
            .cloned()
            .collect();

        let interval_days = (self.cfg.control.test_interval_years * 365.0).round() as i32;
        for (id, farm) in self.state.pop.farms.iter_mut() {
            if restricted.contains(id) {
                let clear_tests = self.rng.random_range(0..=1);
                let last_test = start - self.rng.random_range(0..=FOLLOW_UP_DAYS);
                farm.test_state = TestState::Restricted {
                    last_positive_test: last_test,
                    clear_tests,
                };
                self.state
                    .records
                    .initial_restrictions
                    .push(InitialRestrictionRecord {
                        unit_id: id.clone(),
                        clear_tests,
                        last_test,
                    });
            } else {
                let offset = if interval_days > 1 {
                    self.rng.random_range(0..interval_days)
                } else {
                    0
                };
                farm.test_state = TestState::Free {
                    last_clear_test: start - offset,
                };
            }
        }
        log::debug!("{} herds start under restriction", restricted.len());
    }

    /// Place every seed whose drawn state is not susceptible.
    ///
    /// Seeds of one clade share a founder SNP set. Returns the number of
    /// animals placed.
    fn seed_infections(&mut self, seeds: &[SeedSpec], day: i32) -> Result<usize> {
        let n_founder_snps = self.cfg.seeding.init_mutations_per_clade;
        let mut clades: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();
        let mut n_seeded = 0;

        for seed in seeds {
            if !clades.contains_key(seed.clade.as_str()) {
                let snps = self.state.snps.generate(-1.0, n_founder_snps, 0, &mut self.rng)?;
                clades.insert(&seed.clade, snps.into_iter().collect());
            }
            let snps = clades[seed.clade.as_str()].clone();

            let state_dist =
                WeightedIndex::new(&seed.probs).context("failed to construct seed state weights")?;
            let disease = match (seed.species, state_dist.sample(&mut self.rng)) {
                (_, 0) => None,
                (Species::Cow, 1) => Some(Disease::Cow(CowState::Exposed)),
                (Species::Cow, 2) => Some(Disease::Cow(CowState::TestSensitive)),
                (Species::Cow, _) => Some(Disease::Cow(CowState::Infectious)),
                (Species::Badger, _) => Some(Disease::Badger),
            };
            self.state.records.initial_states.push(InitialStateRecord {
                animal_id: seed.animal_id.clone(),
                unit_id: seed.unit_id.clone(),
                disease,
            });
            let Some(disease) = disease else {
                continue;
            };

            self.place_seed(&seed.animal_id, &seed.unit_id, &snps, disease, day)
                .with_context(|| format!("failed to seed {}", seed.animal_id))?;
            n_seeded += 1;

            let with_badger = self.cfg.control.include_reservoir
                && self.cfg.seeding.init_badgers_from_cows
                && seed.species == Species::Cow;
            if with_badger {
                let connections = self.state.pop.connections(Species::Cow, &seed.unit_id);
                if let Some(reservoir_id) = connections.choose(&mut self.rng).cloned() {
                    let badger_id = format!("Badger_{}", seed.animal_id);
                    self.place_seed(&badger_id, &reservoir_id, &snps, Disease::Badger, day)
                        .with_context(|| format!("failed to seed {badger_id}"))?;
                    n_seeded += 1;
                }
            }
        }

        Ok(n_seeded)
    }

    fn place_seed(
        &mut self,
        id: &str,
        unit_id: &str,
        snps: &BTreeSet<u32>,
        disease: Disease,
        day: i32,
    ) -> Result<()> {
        let species = disease.species();
        if self.state.pop.id_in_use(species, id) {
            bail!("duplicate seed id {id}");
        }
        let unit = self
            .state
            .pop
            .unit_mut(species, unit_id)
            .with_context(|| format!("unknown unit {unit_id}"))?;
        unit.infected_mut().insert(id.to_string());
        if unit.n_infected() > unit.size() {
            let n_infected = unit.n_infected();
            unit.set_size(n_infected);
        }

        let animal = Animal::new(
            id.to_string(),
            unit_id.to_string(),
            snps.clone(),
            day,
            disease,
        );
        self.state.pop.animals_mut(species).insert(id.to_string(), animal);
        self.state.tree.add_child(
            ROOT_ID,
            TreeNode {
                id: id.to_string(),
                species: Some(species),
                unit_id: unit_id.to_string(),
                snps: snps.clone(),
                infection_date: None,
                detection_date: None,
            },
        )?;
        match species {
            Species::Cow => self.state.counts.cows_infected += 1,
            Species::Badger => self.state.counts.badgers_infected += 1,
        }
        Ok(())
    }

    /// Advance step by step until the end date, extinction, or an
    /// outbreak too large to follow.
    pub(crate) fn simulate(&mut self) -> Result<Outcome> {
        let cfg = self.cfg;
        let sim = &cfg.simulation;
        let (end, step) = (sim.end_date, sim.step_size);
        let mut driver = TauLeapFixedStep::new(step as f64);

        let mut time = sim.start_date;
        loop {
            if time > end {
                return Ok(Outcome::Completed);
            }

            let kernel = self
                .perform_step(time)
                .with_context(|| format!("failed to perform step at day {time}"))?;

            if kernel.is_empty() {
                log::debug!("outbreak contained at day {time}");
                return Ok(Outcome::Contained);
            }
            let pop = &self.state.pop;
            let too_large = pop.cows.len() > sim.max_infected_cows
                || pop.badgers.len() > sim.max_infected_badgers;
            if too_large {
                log::debug!(
                    "outbreak too large at day {time}: {} cows, {} badgers",
                    pop.cows.len(),
                    pop.badgers.len()
                );
                return Ok(Outcome::TooLarge);
            }

            log::trace!(
                "day {time}: {} events, total rate {:.4}",
                kernel.len(),
                kernel.total_rate()
            );
            for (idx, n_times) in driver.leap(&kernel, &mut self.rng)? {
                let event = kernel
                    .event(idx)
                    .with_context(|| format!("driver fired unknown event {idx}"))?;
                self.apply_event(event, n_times, time)?;
            }

            time += step;
        }
    }

    /// Exogenous phases of one step, ending with the kernel rebuild.
    pub(crate) fn perform_step(&mut self, time: i32) -> Result<TransitionKernel> {
        let tests = self.due_herd_tests(time);
        self.perform_herd_tests(&tests)
            .context("failed to perform herd tests")?;
        self.move_animals(Species::Cow, time)
            .context("failed to move cattle")?;
        self.move_animals(Species::Badger, time)
            .context("failed to move badgers")?;
        self.sample_slaughter(time)
            .context("failed to sample slaughtered cattle")?;
        self.kill_badgers(time)
            .context("failed to apply badger mortality")?;

        let kernel = TransitionKernel::build(
            &self.state.pop,
            &self.params,
            self.cfg.control.include_reservoir,
        );
        self.state.series.sample(&self.state.pop);
        Ok(kernel)
    }

    fn results(mut self, outcome: Outcome, n_rejected_runs: usize) -> Result<ScenarioResults> {
        let zero_year = self.cfg.simulation.zero_year;
        let landscape = self.landscape;
        let rng = &mut self.rng;
        let observed = self.state.tree.pruned(|node| {
            let Some(date) = node.detection_date else {
                return false;
            };
            let year = (date as f64 / 365.0).floor() as i32 + zero_year;
            let rates = match node.species {
                Some(Species::Cow) => &landscape.cattle_sampling,
                Some(Species::Badger) => &landscape.badger_sampling,
                None => return true,
            };
            let prob = rates.get(&year).copied().unwrap_or(0.0);
            rng.random::<f64>() < prob
        });

        let distances = observed.pairwise_distances();
        let log_likelihood = score(&distances, &landscape.observed_distances)
            .context("failed to score scenario")?;
        log::debug!(
            "scenario finished ({outcome:?}) with {} observed of {} nodes, score {log_likelihood}",
            observed.len(),
            self.state.tree.len()
        );

        let state = self.state;
        let pop = state.pop;
        let outbreak_size = pop.cows.len() + pop.badgers.len();
        let animals = [pop.cows, pop.culled_cows, pop.badgers, pop.expired_badgers]
            .into_iter()
            .flat_map(BTreeMap::into_values)
            .collect();

        Ok(ScenarioResults {
            log_likelihood,
            outcome,
            n_rejected_runs,
            outbreak_size,
            counts: state.counts,
            transmissions: state.transmissions,
            distances,
            reactors: state.reactors,
            tree: state.tree.report(),
            observed_tree: observed.report(),
            series: state.series,
            animals,
            records: state.records,
        })
    }
}

fn off_movement_for(template: &UnitTemplate, size: u32, fixed: bool) -> IntegerDistribution {
    let mut off_movement = template.off_movement.clone();
    if fixed {
        off_movement.retain_bins(|batch| batch <= size);
    }
    off_movement
}

/// Run `cfg.simulation.n_scenarios` replicates in parallel.
///
/// Replicate `i` is seeded with `seed + i`.
pub fn run_replicates(
    landscape: &Landscape,
    cfg: &Config,
    params: Params,
    seed: u64,
) -> Result<Vec<ScenarioResults>> {
    (0..cfg.simulation.n_scenarios)
        .into_par_iter()
        .map(|idx| {
            Scenario::new(landscape, cfg, params, seed.wrapping_add(idx as u64))
                .run()
                .with_context(|| format!("failed to run scenario {idx}"))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::kernel::Transition;
    use crate::model::Population;

    /// Landscape of `n_farms` farms `F1..` of fixed `size`, no data.
    pub fn landscape(n_farms: usize, size: u32) -> Landscape {
        let mut landscape = Landscape::default();
        for idx in 1..=n_farms {
            landscape
                .farms
                .insert(format!("F{idx}"), UnitTemplate::default());
        }
        landscape.herd_sizes.add_count(size, 1);
        landscape.reservoir_sizes.add_count(size, 1);
        landscape.observed_distances = IntegerDistribution::new();
        landscape.observed_distances.add_count(0, 4);
        landscape.observed_distances.add_count(3, 6);
        landscape
    }

    /// Scenario with `pop` installed directly, bypassing initialisation.
    pub fn scenario<'a>(
        landscape: &'a Landscape,
        cfg: &'a Config,
        pop: Population,
    ) -> Scenario<'a> {
        let mut scenario = Scenario::new(landscape, cfg, cfg.model, 17);
        scenario.state.pop = pop;
        for (id, animal) in scenario.state.pop.cows.iter().chain(&scenario.state.pop.badgers) {
            let node = TreeNode {
                id: id.clone(),
                species: Some(animal.disease.species()),
                unit_id: animal.unit_id.clone(),
                snps: animal.snps.clone(),
                infection_date: None,
                detection_date: None,
            };
            scenario.state.tree.add_child(ROOT_ID, node).unwrap();
        }
        scenario
    }

    #[test]
    fn single_infectious_cow_gives_expected_first_kernel() {
        let landscape = landscape(1, 10);
        let mut cfg = sample_config();
        cfg.model.beta_cc = 0.1;
        cfg.simulation.end_date = 4;

        let mut scenario = Scenario::new(&landscape, &cfg, cfg.model, 3);
        scenario.initialise().unwrap();
        assert_eq!(scenario.state.pop.farms["F1"].size, 10);
        assert_eq!(scenario.state.pop.cows.len(), 1);
        assert_eq!(scenario.state.tree.len(), 2);

        let kernel = scenario.perform_step(0).unwrap();
        assert_eq!(kernel.len(), 1);
        let (event, rate) = &kernel.entries()[0];
        assert!(matches!(event.transition, Transition::Infect { target: Species::Cow, .. }));
        assert!((rate - 0.9).abs() < 1e-12);
        assert!(scenario.state.records.herd_tests.is_empty());
    }

    #[test]
    fn reseeding_keeps_only_the_successful_attempt() {
        let landscape = landscape(1, 10);
        let mut cfg = sample_config();
        cfg.seeding.initial_infection_states = "Cow_1:F1:A:0.9,0,0,0.1".to_string();

        for rng_seed in 0..20 {
            let mut scenario = Scenario::new(&landscape, &cfg, cfg.model, rng_seed);
            scenario.initialise().unwrap();
            let records = &scenario.state.records.initial_states;
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].disease, Some(Disease::Cow(CowState::Infectious)));
            assert_eq!(scenario.state.pop.cows.len(), 1);
        }
    }

    #[test]
    fn fixed_herds_never_exceed_capacity() {
        let landscape = landscape(1, 10);
        let mut cfg = sample_config();
        cfg.model.beta_cc = 2.0;
        cfg.model.sigma = 0.5;
        cfg.model.gamma = 0.5;
        cfg.simulation.end_date = 60;

        let mut scenario = Scenario::new(&landscape, &cfg, cfg.model, 9);
        scenario.initialise().unwrap();
        let mut driver = TauLeapFixedStep::new(1.0);
        for time in 0..60 {
            let kernel = scenario.perform_step(time).unwrap();
            for farm in scenario.state.pop.farms.values() {
                assert!(farm.infected.len() as u32 <= farm.size);
            }
            for (idx, n_times) in driver.leap(&kernel, &mut scenario.rng).unwrap() {
                let event = kernel.event(idx).unwrap().clone();
                scenario.apply_event(&event, n_times, time).unwrap();
            }
        }
        let farm = &scenario.state.pop.farms["F1"];
        assert_eq!(farm.infected.len(), 10);
        assert_eq!(scenario.state.counts.cows_infected, 10);
        assert_eq!(scenario.state.tree.len(), 11);
    }

    #[test]
    fn run_produces_consistent_results() {
        let landscape = landscape(2, 20);
        let mut cfg = sample_config();
        cfg.simulation.end_date = 30;
        cfg.model.beta_cc = 0.05;

        let results = Scenario::new(&landscape, &cfg, cfg.model, 5).run().unwrap();
        assert_eq!(results.outcome, Outcome::Completed);
        assert_eq!(results.series.infected_cows.len(), 31);
        assert_eq!(results.tree.edges.len(), results.tree.nodes.len() - 1);
        // nothing is detected, so only the root survives pruning
        assert_eq!(results.observed_tree.nodes.len(), 1);
        assert_eq!(results.log_likelihood, f64::NEG_INFINITY);
        for animal in &results.animals {
            let node = results.tree.nodes.iter().find(|n| n.id == animal.id).unwrap();
            assert_eq!(animal.sample_date, node.detection_date);
        }
    }

    #[test]
    fn contained_outbreaks_are_rerun_up_to_the_cap() {
        let landscape = landscape(1, 1);
        let mut cfg = sample_config();
        cfg.simulation.filter_short_epidemics = true;
        cfg.simulation.max_resample_attempts = Some(3);

        let results = Scenario::new(&landscape, &cfg, cfg.model, 1).run().unwrap();
        assert_eq!(results.outcome, Outcome::Contained);
        assert_eq!(results.n_rejected_runs, 3);
    }

    #[test]
    fn replicates_are_reproducible() {
        let landscape = landscape(2, 15);
        let mut cfg = sample_config();
        cfg.simulation.end_date = 20;
        cfg.simulation.n_scenarios = 3;

        let a = run_replicates(&landscape, &cfg, cfg.model, 99).unwrap();
        let b = run_replicates(&landscape, &cfg, cfg.model, 99).unwrap();
        assert_eq!(a.len(), 3);
        for (a, b) in a.iter().zip(&b) {
            assert_eq!(a.counts, b.counts);
            assert_eq!(a.series, b.series);
        }
    }
}
