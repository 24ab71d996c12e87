//! Event records kept by a scenario for later export.

use crate::model::{Disease, Species};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CattleTestReason {
    Wht,
    PreMovement,
    Slaughter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BadgerTestReason {
    Movement,
    Death,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CattleTestRecord {
    pub date: i32,
    pub unit_id: String,
    pub animal_id: String,
    pub positive: bool,
    pub disease: Disease,
    pub reason: CattleTestReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadgerTestRecord {
    pub date: i32,
    pub animal_id: String,
    pub from_unit: String,
    pub to_unit: String,
    pub captured: bool,
    pub positive: bool,
    pub reason: BadgerTestReason,
}

/// Outcome of testing every infected animal of a herd at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HerdTestRecord {
    pub date: i32,
    pub unit_id: String,
    pub n_tested: u32,
    pub reactors: u32,
    pub reason: CattleTestReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub date: i32,
    pub species: Species,
    pub from_unit: String,
    /// Empty for cattle sent to slaughter.
    pub to_unit: String,
    pub unit_size: u32,
    pub batch: u32,
    pub infected_in_unit: u32,
    pub infected_moved: u32,
    /// Whether a positive pre-movement test stopped the move.
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSizeRecord {
    pub species: Species,
    pub unit_id: String,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialStateRecord {
    pub animal_id: String,
    pub unit_id: String,
    /// `None` when the seed drew the susceptible state.
    pub disease: Option<Disease>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialRestrictionRecord {
    pub unit_id: String,
    pub clear_tests: u32,
    pub last_test: i32,
}

/// Every record produced over one scenario run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Records {
    pub cattle_tests: Vec<CattleTestRecord>,
    pub badger_tests: Vec<BadgerTestRecord>,
    pub herd_tests: Vec<HerdTestRecord>,
    pub movements: Vec<MovementRecord>,
    pub initial_sizes: Vec<InitialSizeRecord>,
    pub initial_states: Vec<InitialStateRecord>,
    pub initial_restrictions: Vec<InitialRestrictionRecord>,
}
