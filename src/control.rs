//! Exogenous phases of a step: scheduled herd tests, movements,
//! slaughter sampling and badger mortality.

use crate::dist::sample_hypergeometric;
use crate::model::{Species, TestState};
use crate::records::{BadgerTestReason, CattleTestReason, MovementRecord};
use crate::scenario::{FOLLOW_UP_DAYS, Scenario};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use std::collections::BTreeMap;

/// Draws of movement pairs allowed per pair in the table, per step.
const MAX_DRAWS_PER_PAIR: usize = 100;

impl Scenario<'_> {
    /// Herd tests falling due before the end of the step starting at `time`,
    /// in date order.
    ///
    /// Free herds are due one test interval after their last clear test,
    /// restricted herds a follow-up period after their last positive test.
    /// Overdue tests are held at `time`.
    pub(crate) fn due_herd_tests(&self, time: i32) -> Vec<(i32, String)> {
        let step = self.cfg.simulation.step_size;
        let interval_days = (self.cfg.control.test_interval_years * 365.0).round() as i32;

        let mut tests: Vec<(i32, String)> = self
            .state
            .pop
            .farms
            .values()
            .filter_map(|farm| {
                let due = match farm.test_state {
                    TestState::Free { last_clear_test } => last_clear_test + interval_days,
                    TestState::Restricted {
                        last_positive_test, ..
                    } => last_positive_test + FOLLOW_UP_DAYS,
                };
                (due < time + step).then(|| (due.max(time), farm.id.clone()))
            })
            .collect();
        tests.sort();
        tests
    }

    pub(crate) fn perform_herd_tests(&mut self, tests: &[(i32, String)]) -> Result<()> {
        for (date, farm_id) in tests {
            let reactors = self
                .whole_herd_test(farm_id, *date, CattleTestReason::Wht)
                .with_context(|| format!("failed to test herd {farm_id}"))?;
            self.apply_herd_result(farm_id, *date, reactors)?;
        }
        if !tests.is_empty() {
            log::trace!("performed {} herd tests", tests.len());
        }
        Ok(())
    }

    /// Move animals of `species` between units until the step's quota is
    /// reached.
    ///
    /// Pairs are drawn from the empirical movement table. Cattle moves
    /// touching a restricted herd are skipped, and a positive pre-movement
    /// test cancels the whole batch and restricts the departure herd.
    pub(crate) fn move_animals(&mut self, species: Species, time: i32) -> Result<()> {
        let (cfg, landscape) = (self.cfg, self.landscape);
        let control = &cfg.control;
        let (table, fixed) = match species {
            Species::Cow => (&landscape.cattle_movements, control.herd_size_fixed),
            Species::Badger => {
                if !control.include_reservoir {
                    return Ok(());
                }
                (&landscape.badger_movements, control.reservoir_size_fixed)
            }
        };
        if table.pairs.is_empty() {
            return Ok(());
        }

        let window = (control.movement_end_date - control.movement_start_date) as f64;
        let quota = table.total_animals as f64 * cfg.simulation.step_size as f64 / window;
        let max_draws = MAX_DRAWS_PER_PAIR * table.pairs.len();

        let mut n_moved = 0;
        let mut n_draws = 0;
        while (n_moved as f64) < quota && n_draws < max_draws {
            n_draws += 1;
            let Some((from, to)) = table.pairs.choose(&mut self.rng) else {
                break;
            };
            if let Some(batch) = self.move_batch(species, from, to, fixed, time)? {
                n_moved += batch as u64;
            }
        }
        if (n_moved as f64) < quota {
            log::debug!("{species:?} movement quota {quota:.1} not reached at day {time}");
        }
        Ok(())
    }

    /// Try one batch move and return the number of animals moved, or `None`
    /// if the pair was skipped. A cancelled batch moves none.
    fn move_batch(
        &mut self,
        species: Species,
        from: &str,
        to: &str,
        fixed: bool,
        time: i32,
    ) -> Result<Option<u32>> {
        let pop = &self.state.pop;
        let departure = pop
            .unit(species, from)
            .with_context(|| format!("unknown departure {from}"))?;
        let destination = pop
            .unit(species, to)
            .with_context(|| format!("unknown destination {to}"))?;
        if departure.is_restricted() || destination.is_restricted() {
            return Ok(None);
        }

        let Some(batch) = departure.random_off_movement_size(&mut self.rng) else {
            return Ok(None);
        };
        let unit_size = departure.size();
        if batch == 0 || batch > unit_size || (!fixed && batch >= unit_size) {
            return Ok(None);
        }

        let infected: Vec<String> = departure.infected().iter().cloned().collect();
        let infected_in_unit = infected.len() as u32;
        let n_movers = sample_hypergeometric(
            unit_size as u64,
            batch as u64,
            infected_in_unit as u64,
            &mut self.rng,
        )?;
        let movers: Vec<String> = infected
            .choose_multiple(&mut self.rng, n_movers as usize)
            .cloned()
            .collect();

        let mut reactors = 0;
        for id in &movers {
            match species {
                Species::Cow => {
                    if self.test_cow(id, time, CattleTestReason::PreMovement)? {
                        reactors += 1;
                    }
                }
                Species::Badger => {
                    let captured = self.cfg.control.capture_badgers_on_move;
                    self.test_badger(id, from, to, captured, time, BadgerTestReason::Movement)?;
                }
            }
        }
        if species == Species::Cow {
            self.record_herd_test(
                from,
                time,
                infected_in_unit,
                reactors,
                CattleTestReason::PreMovement,
            )?;
        }
        let cancelled = reactors > 0;

        self.state.records.movements.push(MovementRecord {
            date: time,
            species,
            from_unit: from.to_string(),
            to_unit: to.to_string(),
            unit_size,
            batch,
            infected_in_unit,
            infected_moved: if cancelled { 0 } else { movers.len() as u32 },
            cancelled,
        });
        if cancelled {
            self.restrict_herd(from, time)?;
            return Ok(Some(0));
        }

        for id in &movers {
            self.relocate(species, id, from, to)?;
        }
        if fixed {
            let destination = self
                .state
                .pop
                .unit_mut(species, to)
                .with_context(|| format!("unknown destination {to}"))?;
            if destination.n_infected() > destination.size() {
                let n_infected = destination.n_infected();
                destination.set_size(n_infected);
            }
        } else {
            for (unit_id, delta) in [(from, -(batch as i64)), (to, batch as i64)] {
                self.state
                    .pop
                    .unit_mut(species, unit_id)
                    .with_context(|| format!("unknown unit {unit_id}"))?
                    .change_size(delta);
            }
        }

        let counts = &mut self.state.counts;
        match species {
            Species::Cow => {
                counts.cows_moved += batch as u64;
                counts.infected_cows_moved += movers.len() as u64;
            }
            Species::Badger => {
                counts.badgers_moved += batch as u64;
                counts.infected_badgers_moved += movers.len() as u64;
            }
        }
        Ok(Some(batch))
    }

    fn relocate(&mut self, species: Species, id: &str, from: &str, to: &str) -> Result<()> {
        let pop = &mut self.state.pop;
        pop.unit_mut(species, from)
            .with_context(|| format!("unknown unit {from}"))?
            .infected_mut()
            .remove(id);
        pop.unit_mut(species, to)
            .with_context(|| format!("unknown unit {to}"))?
            .infected_mut()
            .insert(id.to_string());
        pop.animals_mut(species)
            .get_mut(id)
            .with_context(|| format!("no live animal {id} to move"))?
            .relocate(to);
        Ok(())
    }

    /// Test the infected cattle among animals sent to slaughter this step.
    pub(crate) fn sample_slaughter(&mut self, time: i32) -> Result<()> {
        let landscape = self.landscape;
        let step = self.cfg.simulation.step_size;

        let mut per_farm: BTreeMap<&str, u32> = BTreeMap::new();
        for farm_ids in landscape.slaughter.range(time..time + step).map(|(_, ids)| ids) {
            for farm_id in farm_ids {
                *per_farm.entry(farm_id.as_str()).or_insert(0) += 1;
            }
        }

        for (farm_id, n_slaughtered) in per_farm {
            let Some(farm) = self.state.pop.farms.get(farm_id) else {
                log::debug!("slaughter schedule names unknown farm {farm_id}");
                continue;
            };
            let population = farm.size;
            let infected: Vec<String> = farm.infected.iter().cloned().collect();
            if infected.len() as u32 > population {
                bail!(
                    "{} infected cows exceed herd size {population} of {farm_id}",
                    infected.len()
                );
            }

            let n_slaughtered = n_slaughtered.min(population);
            let n_infected = sample_hypergeometric(
                population as u64,
                n_slaughtered as u64,
                infected.len() as u64,
                &mut self.rng,
            )?;
            let slaughtered: Vec<String> = infected
                .choose_multiple(&mut self.rng, n_infected as usize)
                .cloned()
                .collect();
            self.state.records.movements.push(MovementRecord {
                date: time,
                species: Species::Cow,
                from_unit: farm_id.to_string(),
                to_unit: String::new(),
                unit_size: population,
                batch: n_slaughtered,
                infected_in_unit: infected.len() as u32,
                infected_moved: slaughtered.len() as u32,
                cancelled: false,
            });

            let mut reactors = 0;
            for cow_id in &slaughtered {
                if self.test_cow(cow_id, time, CattleTestReason::Slaughter)? {
                    reactors += 1;
                }
            }
            self.record_herd_test(
                farm_id,
                time,
                infected.len() as u32,
                reactors,
                CattleTestReason::Slaughter,
            )?;
            self.state.counts.infected_cows_at_slaughter += reactors as u64;
            if reactors > 0 {
                self.restrict_herd(farm_id, time)?;
            }
        }
        Ok(())
    }

    /// Each live badger dies with the per-step death probability; dead
    /// badgers are tested, sampled and retired.
    pub(crate) fn kill_badgers(&mut self, time: i32) -> Result<()> {
        let death_prob = self.cfg.badger_death_prob();
        if death_prob <= 0.0 {
            return Ok(());
        }

        let ids: Vec<String> = self.state.pop.badgers.keys().cloned().collect();
        for id in ids {
            if self.rng.random::<f64>() >= death_prob {
                continue;
            }
            let unit_id = self.state.pop.badgers[&id].unit_id.clone();
            self.test_badger(&id, &unit_id, &unit_id, false, time, BadgerTestReason::Death)?;
            self.sample_animal(Species::Badger, &id, time)?;

            if let Some(badger) = self.state.pop.badgers.remove(&id) {
                self.state.pop.expired_badgers.insert(id.clone(), badger);
            }
            if let Some(reservoir) = self.state.pop.reservoirs.get_mut(&unit_id) {
                reservoir.infected.remove(&id);
            }
            self.state.counts.infected_badgers_dead += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::tests::sample_config;
    use crate::dist::IntegerDistribution;
    use crate::input::{Landscape, MovementTable};
    use crate::kernel::tests::{farm, reservoir, seed};
    use crate::model::{CowState, Disease, Population, Species, TestState};
    use crate::records::CattleTestReason;
    use crate::scenario::tests::scenario;
    use rand::SeedableRng;

    fn batches(sizes: &[(u32, u64)]) -> IntegerDistribution {
        let mut dist = IntegerDistribution::new();
        for &(bin, freq) in sizes {
            dist.add_count(bin, freq);
        }
        dist
    }

    fn movements(pairs: &[(&str, &str)], total_animals: u64) -> MovementTable {
        MovementTable {
            pairs: pairs
                .iter()
                .map(|&(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            total_animals,
        }
    }

    #[test]
    fn herd_tests_fall_due_on_schedule() {
        let landscape = Landscape::default();
        let mut cfg = sample_config();
        cfg.control.test_interval_years = 1.0;
        cfg.simulation.step_size = 7;
        let mut pop = Population::default();
        for id in ["F1", "F2", "F3", "F4"] {
            pop.farms.insert(id.to_string(), farm(id, 10, &[]));
        }
        pop.farms.get_mut("F1").unwrap().test_state = TestState::Free {
            last_clear_test: -360,
        };
        pop.farms.get_mut("F2").unwrap().test_state = TestState::Free {
            last_clear_test: -300,
        };
        pop.farms.get_mut("F3").unwrap().test_state = TestState::Restricted {
            last_positive_test: -57,
            clear_tests: 1,
        };
        pop.farms.get_mut("F4").unwrap().test_state = TestState::Restricted {
            last_positive_test: -70,
            clear_tests: 0,
        };
        let scenario = scenario(&landscape, &cfg, pop);

        let tests = scenario.due_herd_tests(0);
        assert_eq!(
            tests,
            vec![
                (0, "F4".to_string()),
                (3, "F3".to_string()),
                (5, "F1".to_string()),
            ]
        );
    }

    #[test]
    fn badger_batch_moves_between_connected_reservoirs() {
        let mut landscape = Landscape::default();
        landscape.badger_movements = movements(&[("R1", "R2")], 3);
        let mut cfg = sample_config();
        cfg.control.include_reservoir = true;
        cfg.control.reservoir_size_fixed = false;
        cfg.control.movement_start_date = 0;
        cfg.control.movement_end_date = 1;

        let mut pop = Population::default();
        pop.farms.insert("F1".to_string(), farm("F1", 10, &["R1", "R2"]));
        pop.farms.insert("F2".to_string(), farm("F2", 10, &["R1", "R2"]));
        let mut r1 = reservoir("R1", 5, &["F1", "F2"]);
        r1.off_movement = batches(&[(3, 1)]);
        pop.reservoirs.insert("R1".to_string(), r1);
        pop.reservoirs.insert("R2".to_string(), reservoir("R2", 5, &["F1", "F2"]));
        seed(&mut pop, "Badger_1", "R1", Disease::Badger);
        seed(&mut pop, "Badger_2", "R1", Disease::Badger);

        let mut n_none_moved = 0;
        for rng_seed in 0..200 {
            let mut scenario = scenario(&landscape, &cfg, pop.clone());
            scenario.rng = SeedableRng::seed_from_u64(rng_seed);
            scenario.move_animals(Species::Badger, 0).unwrap();

            let state = &scenario.state;
            let record = &state.records.movements[0];
            assert_eq!(state.records.movements.len(), 1);
            assert_eq!(record.batch, 3);
            assert_eq!(record.infected_in_unit, 2);
            assert!(record.infected_moved <= 2);
            assert_eq!(state.pop.reservoirs["R1"].size, 2);
            assert_eq!(state.pop.reservoirs["R2"].size, 8);
            assert_eq!(
                state.pop.reservoirs["R2"].infected.len() as u32,
                record.infected_moved
            );
            assert_eq!(state.records.badger_tests.len() as u32, record.infected_moved);
            for id in &state.pop.reservoirs["R2"].infected {
                assert_eq!(state.pop.badgers[id].unit_history, vec!["R1", "R2"]);
            }
            if record.infected_moved == 0 {
                n_none_moved += 1;
            }
        }
        // P(0) = C(3,3) / C(5,3) = 0.1
        assert!((5..=40).contains(&n_none_moved), "{n_none_moved}");
    }

    #[test]
    fn restricted_herds_never_trade() {
        let mut landscape = Landscape::default();
        landscape.cattle_movements = movements(&[("F1", "F2"), ("F2", "F3")], 40);
        let mut cfg = sample_config();
        cfg.control.movement_start_date = 0;
        cfg.control.movement_end_date = 2;

        let mut pop = Population::default();
        for id in ["F1", "F2", "F3"] {
            let mut farm = farm(id, 10, &[]);
            farm.off_movement = batches(&[(1, 1), (2, 1)]);
            pop.farms.insert(id.to_string(), farm);
        }
        pop.farms.get_mut("F2").unwrap().test_state = TestState::Restricted {
            last_positive_test: 0,
            clear_tests: 0,
        };
        let mut scenario = scenario(&landscape, &cfg, pop);

        for time in 0..10 {
            scenario.move_animals(Species::Cow, time).unwrap();
        }
        assert!(scenario.state.records.movements.is_empty());
        assert_eq!(scenario.state.counts.cows_moved, 0);
    }

    #[test]
    fn positive_pre_movement_test_cancels_batch() {
        let mut landscape = Landscape::default();
        landscape.cattle_movements = movements(&[("F1", "F2")], 4);
        let mut cfg = sample_config();
        cfg.control.movement_start_date = 0;
        cfg.control.movement_end_date = 1;

        let mut pop = Population::default();
        let mut f1 = farm("F1", 4, &[]);
        f1.off_movement = batches(&[(4, 1)]);
        pop.farms.insert("F1".to_string(), f1);
        pop.farms.insert("F2".to_string(), farm("F2", 10, &[]));
        seed(&mut pop, "Cow_1", "F1", Disease::Cow(CowState::Infectious));
        seed(&mut pop, "Cow_2", "F1", Disease::Cow(CowState::Exposed));
        let mut scenario = scenario(&landscape, &cfg, pop);

        scenario.move_animals(Species::Cow, 0).unwrap();

        let state = &scenario.state;
        let record = &state.records.movements[0];
        assert!(record.cancelled);
        assert_eq!(record.infected_moved, 0);
        assert!(matches!(
            state.pop.farms["F1"].test_state,
            TestState::Restricted {
                last_positive_test: 0,
                ..
            }
        ));
        assert!(state.pop.farms["F2"].infected.is_empty());
        assert!(state.pop.culled_cows.contains_key("Cow_1"));
        assert_eq!(state.pop.cows["Cow_2"].unit_id, "F1");
        assert_eq!(state.counts.cows_moved, 0);

        let herd_test = &state.records.herd_tests[0];
        assert_eq!(state.records.herd_tests.len(), 1);
        assert_eq!(herd_test.unit_id, "F1");
        assert_eq!(herd_test.n_tested, 2);
        assert_eq!(herd_test.reactors, 1);
        assert_eq!(herd_test.reason, CattleTestReason::PreMovement);
    }

    #[test]
    fn cancelled_batch_leaves_quota_to_other_pairs() {
        let mut landscape = Landscape::default();
        landscape.cattle_movements = movements(&[("F1", "F2"), ("F3", "F4")], 4);
        let mut cfg = sample_config();
        cfg.control.movement_start_date = 0;
        cfg.control.movement_end_date = 1;

        let mut pop = Population::default();
        for (id, size) in [("F1", 4), ("F2", 10), ("F3", 10), ("F4", 10)] {
            let mut farm = farm(id, size, &[]);
            farm.off_movement = batches(&[(4, 1)]);
            pop.farms.insert(id.to_string(), farm);
        }
        seed(&mut pop, "Cow_1", "F1", Disease::Cow(CowState::Infectious));

        let mut n_cancelled = 0;
        for rng_seed in 0..50 {
            let mut scenario = scenario(&landscape, &cfg, pop.clone());
            scenario.rng = SeedableRng::seed_from_u64(rng_seed);
            scenario.move_animals(Species::Cow, 0).unwrap();

            let state = &scenario.state;
            let cancelled = state.records.movements.iter().any(|m| m.cancelled);
            if cancelled {
                n_cancelled += 1;
                assert!(state.pop.culled_cows.contains_key("Cow_1"));
            }
            assert_eq!(state.counts.cows_moved, 4);
            let moved_from_f3 = state
                .records
                .movements
                .iter()
                .filter(|m| m.from_unit == "F3")
                .count();
            assert_eq!(moved_from_f3, 1);
        }
        assert!(n_cancelled > 0);
    }

    #[test]
    fn fixed_destination_grows_to_fit_arrivals() {
        let mut landscape = Landscape::default();
        landscape.cattle_movements = movements(&[("F1", "F2")], 3);
        let mut cfg = sample_config();
        cfg.model.test_sensitivity = 0.0;
        cfg.control.movement_start_date = 0;
        cfg.control.movement_end_date = 1;

        let mut pop = Population::default();
        let mut f1 = farm("F1", 3, &[]);
        f1.off_movement = batches(&[(3, 1)]);
        pop.farms.insert("F1".to_string(), f1);
        pop.farms.insert("F2".to_string(), farm("F2", 1, &[]));
        for id in ["Cow_1", "Cow_2", "Cow_3"] {
            seed(&mut pop, id, "F1", Disease::Cow(CowState::Infectious));
        }
        let mut scenario = scenario(&landscape, &cfg, pop);

        scenario.move_animals(Species::Cow, 0).unwrap();

        let state = &scenario.state;
        assert_eq!(state.pop.farms["F2"].infected.len(), 3);
        assert_eq!(state.pop.farms["F2"].size, 3);
        assert_eq!(state.pop.farms["F1"].size, 3);
        assert_eq!(state.counts.infected_cows_moved, 3);
        assert_eq!(state.records.cattle_tests.len(), 3);
    }

    #[test]
    fn whole_herd_slaughter_tests_every_infected_cow() {
        let mut landscape = Landscape::default();
        landscape.slaughter.insert(3, vec!["F1".to_string(); 12]);
        landscape.slaughter.insert(9, vec!["F1".to_string()]);
        let mut cfg = sample_config();
        cfg.simulation.step_size = 5;

        let mut pop = Population::default();
        pop.farms.insert("F1".to_string(), farm("F1", 10, &[]));
        seed(&mut pop, "Cow_1", "F1", Disease::Cow(CowState::Infectious));
        seed(&mut pop, "Cow_2", "F1", Disease::Cow(CowState::Exposed));
        let mut scenario = scenario(&landscape, &cfg, pop);

        scenario.sample_slaughter(0).unwrap();

        let state = &scenario.state;
        assert_eq!(state.records.cattle_tests.len(), 2);
        assert_eq!(state.counts.infected_cows_at_slaughter, 1);
        assert!(matches!(
            state.pop.farms["F1"].test_state,
            TestState::Restricted {
                last_positive_test: 0,
                ..
            }
        ));
        assert_eq!(state.pop.culled_cows["Cow_1"].sample_date, Some(0));

        let removal = &state.records.movements[0];
        assert_eq!(state.records.movements.len(), 1);
        assert_eq!(removal.from_unit, "F1");
        assert!(removal.to_unit.is_empty());
        assert_eq!(removal.batch, 10);
        assert_eq!(removal.infected_moved, 2);

        let herd_test = &state.records.herd_tests[0];
        assert_eq!(state.records.herd_tests.len(), 1);
        assert_eq!(herd_test.n_tested, 2);
        assert_eq!(herd_test.reactors, 1);
        assert_eq!(herd_test.reason, CattleTestReason::Slaughter);
    }

    #[test]
    fn oversubscribed_herd_is_fatal_at_slaughter() {
        let mut landscape = Landscape::default();
        landscape.slaughter.insert(0, vec!["F1".to_string()]);
        let cfg = sample_config();

        let mut pop = Population::default();
        pop.farms.insert("F1".to_string(), farm("F1", 1, &[]));
        seed(&mut pop, "Cow_1", "F1", Disease::Cow(CowState::Exposed));
        seed(&mut pop, "Cow_2", "F1", Disease::Cow(CowState::Exposed));
        let mut scenario = scenario(&landscape, &cfg, pop);

        assert!(scenario.sample_slaughter(0).is_err());
    }

    #[test]
    fn dead_badgers_are_sampled_and_retired() {
        let landscape = Landscape::default();
        let mut cfg = sample_config();
        cfg.control.badger_death_rate = 1.0;
        cfg.simulation.step_size = 365;

        let mut pop = Population::default();
        pop.reservoirs.insert("R1".to_string(), reservoir("R1", 5, &[]));
        seed(&mut pop, "Badger_1", "R1", Disease::Badger);
        seed(&mut pop, "Badger_2", "R1", Disease::Badger);
        let mut scenario = scenario(&landscape, &cfg, pop);

        scenario.kill_badgers(30).unwrap();

        let state = &scenario.state;
        assert!(state.pop.badgers.is_empty());
        assert!(state.pop.reservoirs["R1"].infected.is_empty());
        assert_eq!(state.counts.infected_badgers_dead, 2);
        assert_eq!(state.records.badger_tests.len(), 2);
        for (id, badger) in &state.pop.expired_badgers {
            assert_eq!(badger.sample_date, Some(30));
            assert_eq!(state.tree.node(id).unwrap().detection_date, Some(30));
        }
    }
}
