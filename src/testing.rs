//! Diagnostic testing of cattle and badgers, and herd restrictions.

use crate::model::{Species, TestState, Unit};
use crate::records::{
    BadgerTestReason, BadgerTestRecord, CattleTestReason, CattleTestRecord, HerdTestRecord,
};
use crate::scenario::Scenario;
use anyhow::{Context, Result, bail};
use rand::prelude::*;

/// Clear follow-up tests needed to lift a restriction.
pub const CLEAR_TESTS_TO_LIFT: u32 = 2;

impl Scenario<'_> {
    /// Test one live cow. A reactor is sampled and culled.
    pub(crate) fn test_cow(
        &mut self,
        cow_id: &str,
        date: i32,
        reason: CattleTestReason,
    ) -> Result<bool> {
        let cow = self
            .state
            .pop
            .cows
            .get(cow_id)
            .with_context(|| format!("no live cow {cow_id} to test"))?;
        let disease = cow.disease;
        let unit_id = cow.unit_id.clone();
        let positive =
            disease.is_detectable() && self.rng.random::<f64>() < self.params.test_sensitivity;

        self.state.records.cattle_tests.push(CattleTestRecord {
            date,
            unit_id: unit_id.clone(),
            animal_id: cow_id.to_string(),
            positive,
            disease,
            reason,
        });
        if !positive {
            return Ok(false);
        }

        self.sample_animal(Species::Cow, cow_id, date)?;
        if let Some(cow) = self.state.pop.cows.remove(cow_id) {
            self.state.pop.culled_cows.insert(cow_id.to_string(), cow);
        }
        if let Some(farm) = self.state.pop.farms.get_mut(&unit_id) {
            farm.infected.remove(cow_id);
        }
        self.state.counts.cows_culled += 1;
        Ok(true)
    }

    /// Test every infected cow of a herd and return the number of reactors.
    pub(crate) fn whole_herd_test(
        &mut self,
        farm_id: &str,
        date: i32,
        reason: CattleTestReason,
    ) -> Result<u32> {
        let farm = self
            .state
            .pop
            .farms
            .get(farm_id)
            .with_context(|| format!("unknown farm {farm_id}"))?;
        let infected: Vec<String> = farm.infected.iter().cloned().collect();
        let n_tested = infected.len() as u32;

        let mut reactors = 0;
        for cow_id in &infected {
            if self.test_cow(cow_id, date, reason)? {
                reactors += 1;
            }
        }
        self.record_herd_test(farm_id, date, n_tested, reactors, reason)?;
        Ok(reactors)
    }

    /// Record one round of tests on a herd's infected cattle.
    pub(crate) fn record_herd_test(
        &mut self,
        farm_id: &str,
        date: i32,
        n_infected: u32,
        reactors: u32,
        reason: CattleTestReason,
    ) -> Result<()> {
        if reactors > n_infected {
            bail!("{reactors} reactors among {n_infected} infected cows on {farm_id}");
        }
        self.state.records.herd_tests.push(HerdTestRecord {
            date,
            unit_id: farm_id.to_string(),
            n_tested: n_infected,
            reactors,
            reason,
        });
        Ok(())
    }

    /// Test a badger. Only captured badgers can test positive; a positive
    /// badger is sampled but stays where it is.
    pub(crate) fn test_badger(
        &mut self,
        badger_id: &str,
        from_unit: &str,
        to_unit: &str,
        captured: bool,
        date: i32,
        reason: BadgerTestReason,
    ) -> Result<bool> {
        let positive = captured && self.rng.random::<f64>() < self.params.test_sensitivity;
        self.state.records.badger_tests.push(BadgerTestRecord {
            date,
            animal_id: badger_id.to_string(),
            from_unit: from_unit.to_string(),
            to_unit: to_unit.to_string(),
            captured,
            positive,
            reason,
        });
        if positive {
            self.sample_animal(Species::Badger, badger_id, date)?;
        }
        Ok(positive)
    }

    /// Take a sample: bring the SNPs up to date and mark the detection.
    pub(crate) fn sample_animal(&mut self, species: Species, id: &str, date: i32) -> Result<()> {
        let animal = self
            .state
            .pop
            .animals_mut(species)
            .get_mut(id)
            .with_context(|| format!("no live animal {id} to sample"))?;
        self.state
            .snps
            .advance(animal, self.params.mutation_rate, date, &mut self.rng)?;
        animal.sample_date = Some(date);
        self.state.tree.set_detection_date(id, date)
    }

    /// Update a herd's test state after a scheduled whole-herd test.
    pub(crate) fn apply_herd_result(
        &mut self,
        farm_id: &str,
        date: i32,
        reactors: u32,
    ) -> Result<()> {
        if reactors > 0 {
            self.state.reactors.add_count(reactors, 1);
            return self.restrict_herd(farm_id, date);
        }

        let farm = self
            .state
            .pop
            .farms
            .get_mut(farm_id)
            .with_context(|| format!("unknown farm {farm_id}"))?;
        farm.test_state = match farm.test_state {
            TestState::Free { .. } => TestState::Free {
                last_clear_test: date,
            },
            TestState::Restricted { clear_tests, .. }
                if clear_tests + 1 >= CLEAR_TESTS_TO_LIFT =>
            {
                log::trace!("restriction lifted on {farm_id} at day {date}");
                TestState::Free {
                    last_clear_test: date,
                }
            }
            TestState::Restricted { clear_tests, .. } => TestState::Restricted {
                last_positive_test: date,
                clear_tests: clear_tests + 1,
            },
        };
        Ok(())
    }

    /// Put a herd under restriction with its follow-up count reset.
    pub(crate) fn restrict_herd(&mut self, farm_id: &str, date: i32) -> Result<()> {
        let farm = self
            .state
            .pop
            .farms
            .get_mut(farm_id)
            .with_context(|| format!("unknown farm {farm_id}"))?;
        if !farm.is_restricted() {
            log::trace!("{farm_id} restricted at day {date}");
        }
        farm.test_state = TestState::Restricted {
            last_positive_test: date,
            clear_tests: 0,
        };
        Ok(())
    }
}
