use crate::dist::IntegerDistribution;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Species {
    Cow,
    Badger,
}

impl Species {
    /// Prefix of the identifiers given to newly infected animals.
    pub fn id_prefix(self) -> &'static str {
        match self {
            Species::Cow => "Cow",
            Species::Badger => "Badger",
        }
    }
}

/// Disease progress of an infected cow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CowState {
    Exposed,
    TestSensitive,
    Infectious,
}

/// Disease state of an infected animal. Badgers are always infectious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disease {
    Cow(CowState),
    Badger,
}

impl Disease {
    pub fn species(self) -> Species {
        match self {
            Disease::Cow(_) => Species::Cow,
            Disease::Badger => Species::Badger,
        }
    }

    /// Whether a diagnostic test can pick this animal up.
    pub fn is_detectable(self) -> bool {
        matches!(
            self,
            Disease::Cow(CowState::TestSensitive | CowState::Infectious) | Disease::Badger
        )
    }
}

/// An infected individual, cow or badger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Animal {
    pub id: String,
    pub unit_id: String,
    pub snps: BTreeSet<u32>,
    pub last_snp_day: i32,
    pub sample_date: Option<i32>,
    pub unit_history: Vec<String>,
    pub disease: Disease,
}

impl Animal {
    pub fn new(
        id: String,
        unit_id: String,
        snps: BTreeSet<u32>,
        day: i32,
        disease: Disease,
    ) -> Self {
        Self {
            id,
            unit_history: vec![unit_id.clone()],
            unit_id,
            snps,
            last_snp_day: day,
            sample_date: None,
            disease,
        }
    }

    pub fn relocate(&mut self, unit_id: &str) {
        self.unit_id = unit_id.to_string();
        self.unit_history.push(unit_id.to_string());
    }
}

/// Regulatory test state of a herd.
///
/// A free herd remembers its last clear test, a restricted herd its last
/// positive test and the number of clear follow-up tests since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestState {
    Free { last_clear_test: i32 },
    Restricted { last_positive_test: i32, clear_tests: u32 },
}


/// Common behaviour of farms and reservoirs.
pub trait Unit {
    fn size(&self) -> u32;

    fn set_size(&mut self, size: u32);

    fn off_movement(&self) -> &IntegerDistribution;

    fn infected(&self) -> &BTreeSet<String>;

    fn infected_mut(&mut self) -> &mut BTreeSet<String>;

    fn is_restricted(&self) -> bool {
        false
    }

    /// Adjust capacity by `delta`, saturating at zero.
    ///
    /// Callers keep membership within capacity when sizes are fixed.
    fn change_size(&mut self, delta: i64) {
        let size = (self.size() as i64 + delta).max(0);
        self.set_size(size as u32);
    }

    fn n_infected(&self) -> u32 {
        self.infected().len() as u32
    }

    fn susceptible(&self) -> u32 {
        self.size().saturating_sub(self.n_infected())
    }

    fn random_off_movement_size(&self, rng: &mut dyn RngCore) -> Option<u32> {
        self.off_movement().random_bin(rng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farm {
    pub id: String,
    pub size: u32,
    pub off_movement: IntegerDistribution,
    pub test_state: TestState,
    pub reservoirs: Vec<String>,
    pub infected: BTreeSet<String>,
}

impl Unit for Farm {
    fn size(&self) -> u32 {
        self.size
    }

    fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    fn off_movement(&self) -> &IntegerDistribution {
        &self.off_movement
    }

    fn infected(&self) -> &BTreeSet<String> {
        &self.infected
    }

    fn infected_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.infected
    }

    fn is_restricted(&self) -> bool {
        matches!(self.test_state, TestState::Restricted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservoir {
    pub id: String,
    pub size: u32,
    pub off_movement: IntegerDistribution,
    pub farms: Vec<String>,
    pub infected: BTreeSet<String>,
}

impl Unit for Reservoir {
    fn size(&self) -> u32 {
        self.size
    }

    fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    fn off_movement(&self) -> &IntegerDistribution {
        &self.off_movement
    }

    fn infected(&self) -> &BTreeSet<String> {
        &self.infected
    }

    fn infected_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.infected
    }
}

/// Units and infected animals owned by one scenario.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Population {
    pub farms: BTreeMap<String, Farm>,
    pub reservoirs: BTreeMap<String, Reservoir>,
    pub cows: BTreeMap<String, Animal>,
    pub badgers: BTreeMap<String, Animal>,
    pub culled_cows: BTreeMap<String, Animal>,
    pub expired_badgers: BTreeMap<String, Animal>,
}

impl Population {
    pub fn animals(&self, species: Species) -> &BTreeMap<String, Animal> {
        match species {
            Species::Cow => &self.cows,
            Species::Badger => &self.badgers,
        }
    }

    pub fn animals_mut(&mut self, species: Species) -> &mut BTreeMap<String, Animal> {
        match species {
            Species::Cow => &mut self.cows,
            Species::Badger => &mut self.badgers,
        }
    }

    /// Whether `id` was ever used for an animal of `species`.
    pub fn id_in_use(&self, species: Species, id: &str) -> bool {
        match species {
            Species::Cow => self.cows.contains_key(id) || self.culled_cows.contains_key(id),
            Species::Badger => {
                self.badgers.contains_key(id) || self.expired_badgers.contains_key(id)
            }
        }
    }

    pub fn unit(&self, species: Species, unit_id: &str) -> Option<&dyn Unit> {
        match species {
            Species::Cow => self.farms.get(unit_id).map(|f| f as &dyn Unit),
            Species::Badger => self.reservoirs.get(unit_id).map(|r| r as &dyn Unit),
        }
    }

    pub fn unit_mut(&mut self, species: Species, unit_id: &str) -> Option<&mut dyn Unit> {
        match species {
            Species::Cow => self.farms.get_mut(unit_id).map(|f| f as &mut dyn Unit),
            Species::Badger => self.reservoirs.get_mut(unit_id).map(|r| r as &mut dyn Unit),
        }
    }

    pub fn susceptible_in(&self, species: Species, unit_id: &str) -> u32 {
        self.unit(species, unit_id).map_or(0, |u| u.susceptible())
    }

    /// Units of the other species in contact with `unit_id`.
    pub fn connections(&self, species: Species, unit_id: &str) -> &[String] {
        match species {
            Species::Cow => self
                .farms
                .get(unit_id)
                .map(|f| f.reservoirs.as_slice())
                .unwrap_or_default(),
            Species::Badger => self
                .reservoirs
                .get(unit_id)
                .map(|r| r.farms.as_slice())
                .unwrap_or_default(),
        }
    }

    pub fn n_infected_farms(&self) -> usize {
        self.farms.values().filter(|f| !f.infected.is_empty()).count()
    }

    pub fn n_restricted_farms(&self) -> usize {
        self.farms.values().filter(|f| f.is_restricted()).count()
    }

    pub fn n_infected_reservoirs(&self) -> usize {
        self.reservoirs.values().filter(|r| !r.infected.is_empty()).count()
    }
}
