use crate::kernel::{Event, Transition};
use crate::model::{Animal, CowState, Disease, Species};
use crate::scenario::Scenario;
use crate::tree::TreeNode;
use anyhow::{Context, Result, bail};
use rand::prelude::*;

impl Scenario<'_> {
    /// Apply a fired event `n_times` times, one firing at a time.
    pub fn apply_event(&mut self, event: &Event, n_times: u64, date: i32) -> Result<()> {
        for _ in 0..n_times {
            self.apply_single_event(event, date)
                .with_context(|| format!("failed to apply {event:?}"))?;
        }
        Ok(())
    }

    fn apply_single_event(&mut self, event: &Event, date: i32) -> Result<()> {
        let source_id = event.source_id.as_str();
        match (event.source, &event.transition) {
            (Species::Cow, Transition::Progress(state)) => {
                if let Some(cow) = self.state.pop.cows.get_mut(source_id) {
                    cow.disease = Disease::Cow(*state);
                }
                Ok(())
            }
            (Species::Badger, Transition::Progress(state)) => {
                bail!("badger {source_id} has no disease state {state:?} to progress to")
            }
            (Species::Cow, Transition::Infect { target: Species::Cow, .. }) => {
                self.infect_within(Species::Cow, source_id, date)
            }
            (Species::Badger, Transition::Infect { target: Species::Badger, .. }) => {
                self.infect_within(Species::Badger, source_id, date)
            }
            (Species::Cow, Transition::Infect { target: Species::Badger, .. }) => {
                self.infect_across(Species::Cow, Species::Badger, source_id, date)
            }
            (Species::Badger, Transition::Infect { target: Species::Cow, .. }) => {
                self.infect_across(Species::Badger, Species::Cow, source_id, date)
            }
        }
    }

    /// Infect a susceptible animal sharing the source's unit.
    fn infect_within(&mut self, species: Species, source_id: &str, date: i32) -> Result<()> {
        let Some(source) = self.state.pop.animals(species).get(source_id) else {
            log::trace!("{source_id} was removed earlier in the step");
            return Ok(());
        };
        let unit_id = source.unit_id.clone();
        if self.state.pop.susceptible_in(species, &unit_id) == 0 {
            log::trace!("no susceptible left in {unit_id}");
            return Ok(());
        }
        self.infect(species, source_id, species, &unit_id, date)
    }

    /// Infect an animal in a connected unit of the other species.
    ///
    /// Connected units are drawn with replacement, as many times as there
    /// are connections, until one with susceptible capacity turns up.
    fn infect_across(
        &mut self,
        source_species: Species,
        target_species: Species,
        source_id: &str,
        date: i32,
    ) -> Result<()> {
        let Some(source) = self.state.pop.animals(source_species).get(source_id) else {
            log::trace!("{source_id} was removed earlier in the step");
            return Ok(());
        };
        let connections = self.state.pop.connections(source_species, &source.unit_id);

        let mut target_unit = None;
        for _ in 0..connections.len() {
            let Some(unit_id) = connections.choose(&mut self.rng) else {
                break;
            };
            if self.state.pop.susceptible_in(target_species, unit_id) > 0 {
                target_unit = Some(unit_id.clone());
                break;
            }
        }
        let Some(unit_id) = target_unit else {
            log::trace!("no connected unit of {source_id} has susceptible capacity");
            return Ok(());
        };
        self.infect(source_species, source_id, target_species, &unit_id, date)
    }

    fn infect(
        &mut self,
        source_species: Species,
        source_id: &str,
        target_species: Species,
        unit_id: &str,
        date: i32,
    ) -> Result<()> {
        let source = self
            .state
            .pop
            .animals_mut(source_species)
            .get_mut(source_id)
            .with_context(|| format!("no live animal {source_id}"))?;
        self.state
            .snps
            .advance(source, self.params.mutation_rate, date, &mut self.rng)?;
        let snps = source.snps.clone();

        let id = self.state.ids.allocate(target_species, &self.state.pop);
        let disease = match target_species {
            Species::Cow => Disease::Cow(CowState::Exposed),
            Species::Badger => Disease::Badger,
        };
        self.state
            .pop
            .unit_mut(target_species, unit_id)
            .with_context(|| format!("unknown unit {unit_id}"))?
            .infected_mut()
            .insert(id.clone());
        let animal = Animal::new(id.clone(), unit_id.to_string(), snps.clone(), date, disease);
        self.state
            .pop
            .animals_mut(target_species)
            .insert(id.clone(), animal);

        self.state.tree.add_child(
            source_id,
            TreeNode {
                id,
                species: Some(target_species),
                unit_id: unit_id.to_string(),
                snps,
                infection_date: Some(date),
                detection_date: None,
            },
        )?;
        self.state.transmissions.record(source_species, target_species);
        match target_species {
            Species::Cow => self.state.counts.cows_infected += 1,
            Species::Badger => self.state.counts.badgers_infected += 1,
        }
        Ok(())
    }
}
