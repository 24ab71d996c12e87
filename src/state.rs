use crate::dist::IntegerDistribution;
use crate::model::{Population, Species};
use crate::mutation::SnpClock;
use crate::records::Records;
use crate::tree::TransmissionTree;
use serde::{Deserialize, Serialize};

/// Hands out ids for newly infected animals.
///
/// Counters are per scenario; ids already present in the population
/// (seeded animals included) are skipped.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next_cow: u32,
    next_badger: u32,
}

impl IdAllocator {
    pub fn allocate(&mut self, species: Species, pop: &Population) -> String {
        let counter = match species {
            Species::Cow => &mut self.next_cow,
            Species::Badger => &mut self.next_badger,
        };
        loop {
            *counter += 1;
            let id = format!("{}_{:05}", species.id_prefix(), *counter);
            if !pop.id_in_use(species, &id) {
                return id;
            }
        }
    }
}

/// Who infected whom, by species.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionCounts {
    pub cow_cow: u64,
    pub cow_badger: u64,
    pub badger_cow: u64,
    pub badger_badger: u64,
}

impl TransmissionCounts {
    pub fn record(&mut self, source: Species, target: Species) {
        let counter = match (source, target) {
            (Species::Cow, Species::Cow) => &mut self.cow_cow,
            (Species::Cow, Species::Badger) => &mut self.cow_badger,
            (Species::Badger, Species::Cow) => &mut self.badger_cow,
            (Species::Badger, Species::Badger) => &mut self.badger_badger,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.cow_cow + self.cow_badger + self.badger_cow + self.badger_badger
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub cows_infected: u64,
    pub badgers_infected: u64,
    pub cows_moved: u64,
    pub badgers_moved: u64,
    pub infected_cows_moved: u64,
    pub infected_badgers_moved: u64,
    pub cows_culled: u64,
    pub infected_cows_at_slaughter: u64,
    pub infected_badgers_dead: u64,
}

/// Counts sampled once per step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutbreakSeries {
    pub infected_herds: Vec<usize>,
    pub restricted_herds: Vec<usize>,
    pub infected_cows: Vec<usize>,
    pub infected_reservoirs: Vec<usize>,
    pub infected_badgers: Vec<usize>,
}

impl OutbreakSeries {
    pub fn sample(&mut self, pop: &Population) {
        self.infected_herds.push(pop.n_infected_farms());
        self.restricted_herds.push(pop.n_restricted_farms());
        self.infected_cows.push(pop.cows.len());
        self.infected_reservoirs.push(pop.n_infected_reservoirs());
        self.infected_badgers.push(pop.badgers.len());
    }
}

/// Mutable state of one scenario run.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub pop: Population,
    pub tree: TransmissionTree,
    pub snps: SnpClock,
    pub ids: IdAllocator,
    pub counts: Counts,
    pub transmissions: TransmissionCounts,
    /// Reactors found by herd tests that broke down.
    pub reactors: IntegerDistribution,
    pub records: Records,
    pub series: OutbreakSeries,
}
