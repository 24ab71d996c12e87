use crate::config::Params;
use crate::model::{CowState, Disease, Population, Species, Unit};

/// What happens to (or because of) a source animal when an event fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The source cow moves to the given disease state.
    Progress(CowState),
    /// The source infects a new animal of `target` species.
    ///
    /// `unit_id` is the unit whose susceptible count sets the rate.
    Infect { target: Species, unit_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub source: Species,
    pub source_id: String,
    pub transition: Transition,
}

/// Table of candidate events and their rates for one step.
///
/// Rebuilt from scratch every step and never updated in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionKernel {
    entries: Vec<(Event, f64)>,
}

impl TransitionKernel {
    /// Build the kernel from the current population.
    ///
    /// Only events with a positive rate are kept. Iteration follows the
    /// ordered population maps, so equal states give equal kernels.
    pub fn build(pop: &Population, params: &Params, include_reservoir: bool) -> Self {
        let mut kernel = Self::default();

        for cow in pop.cows.values() {
            let Disease::Cow(state) = cow.disease else {
                continue;
            };
            match state {
                CowState::Exposed => {
                    let transition = Transition::Progress(CowState::TestSensitive);
                    kernel.push(Species::Cow, &cow.id, transition, params.sigma);
                }
                CowState::TestSensitive => {
                    let transition = Transition::Progress(CowState::Infectious);
                    kernel.push(Species::Cow, &cow.id, transition, params.gamma);
                }
                CowState::Infectious => {
                    let Some(farm) = pop.farms.get(&cow.unit_id) else {
                        continue;
                    };
                    kernel.push_infection(
                        Species::Cow,
                        &cow.id,
                        Species::Cow,
                        &farm.id,
                        farm.susceptible() as f64 * params.beta_cc,
                    );
                    if include_reservoir {
                        for reservoir_id in &farm.reservoirs {
                            let susceptible = pop.susceptible_in(Species::Badger, reservoir_id);
                            kernel.push_infection(
                                Species::Cow,
                                &cow.id,
                                Species::Badger,
                                reservoir_id,
                                susceptible as f64 * params.beta_cb,
                            );
                        }
                    }
                }
            }
        }

        if include_reservoir {
            for badger in pop.badgers.values() {
                let Some(reservoir) = pop.reservoirs.get(&badger.unit_id) else {
                    continue;
                };
                kernel.push_infection(
                    Species::Badger,
                    &badger.id,
                    Species::Badger,
                    &reservoir.id,
                    reservoir.susceptible() as f64 * params.beta_bb,
                );
                for farm_id in &reservoir.farms {
                    let susceptible = pop.susceptible_in(Species::Cow, farm_id);
                    kernel.push_infection(
                        Species::Badger,
                        &badger.id,
                        Species::Cow,
                        farm_id,
                        susceptible as f64 * params.beta_bc,
                    );
                }
            }
        }

        kernel
    }

    fn push(&mut self, source: Species, source_id: &str, transition: Transition, rate: f64) {
        if rate > 0.0 {
            let event = Event {
                source,
                source_id: source_id.to_string(),
                transition,
            };
            self.entries.push((event, rate));
        }
    }

    fn push_infection(
        &mut self,
        source: Species,
        source_id: &str,
        target: Species,
        unit_id: &str,
        rate: f64,
    ) {
        let transition = Transition::Infect {
            target,
            unit_id: unit_id.to_string(),
        };
        self.push(source, source_id, transition, rate);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(Event, f64)] {
        &self.entries
    }

    pub fn event(&self, idx: usize) -> Option<&Event> {
        self.entries.get(idx).map(|(event, _)| event)
    }

    pub fn total_rate(&self) -> f64 {
        self.entries.iter().map(|(_, rate)| rate).sum()
    }
}
