//! Per-replicate results, likelihood scoring and aggregation.

use crate::dist::{IntegerDistribution, ln_factorial, rescale_counts};
use crate::model::Animal;
use crate::records::Records;
use crate::state::{Counts, OutbreakSeries, TransmissionCounts};
use crate::stats::{Accumulator, AccumulatorReport, percentage, series_line};
use crate::tree::TreeReport;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Bin probabilities at or below this contribute nothing to the score.
const MIN_BIN_PROB: f64 = 1e-15;

/// Why a scenario stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Reached the end date.
    Completed,
    /// No transition had a positive rate left.
    Contained,
    /// Too many live infected animals to follow.
    TooLarge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResults {
    pub log_likelihood: f64,
    pub outcome: Outcome,
    /// Contained runs discarded before this one was kept.
    pub n_rejected_runs: usize,
    /// Live infected animals at the end of the run.
    pub outbreak_size: usize,
    pub counts: Counts,
    pub transmissions: TransmissionCounts,
    /// Pairwise SNP distances in the observed tree.
    pub distances: IntegerDistribution,
    pub reactors: IntegerDistribution,
    pub tree: TreeReport,
    pub observed_tree: TreeReport,
    pub series: OutbreakSeries,
    /// Every infected animal, live or removed.
    pub animals: Vec<Animal>,
    pub records: Records,
}

/// Multinomial log-likelihood of the simulated distances given the
/// observed distribution.
///
/// Simulated counts are read at the observed bins and rescaled to the
/// observed total. A simulation with no mass at those bins scores `-inf`.
pub fn score(simulated: &IntegerDistribution, observed: &IntegerDistribution) -> Result<f64> {
    let n_obs = observed.total();
    if n_obs == 0 {
        bail!("observed distance distribution is empty");
    }

    let sim_counts: Vec<u64> = observed
        .bins()
        .map(|(bin, _)| simulated.frequency(bin))
        .collect();
    if sim_counts.iter().all(|&count| count == 0) {
        return Ok(f64::NEG_INFINITY);
    }
    let counts = rescale_counts(&sim_counts, n_obs);

    let mut log_likelihood = ln_factorial(n_obs);
    for ((_, obs_freq), &count) in observed.bins().zip(&counts) {
        log_likelihood -= ln_factorial(count);
        let prob = obs_freq as f64 / n_obs as f64;
        if prob > MIN_BIN_PROB {
            log_likelihood += count as f64 * prob.ln();
        }
    }
    Ok(log_likelihood)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountsReport {
    pub cows_infected: AccumulatorReport,
    pub badgers_infected: AccumulatorReport,
    pub cows_moved: AccumulatorReport,
    pub badgers_moved: AccumulatorReport,
    pub infected_cows_moved: AccumulatorReport,
    pub infected_badgers_moved: AccumulatorReport,
    pub cows_culled: AccumulatorReport,
    pub infected_cows_at_slaughter: AccumulatorReport,
    pub infected_badgers_dead: AccumulatorReport,
    pub outbreak_size: AccumulatorReport,
}

/// Share of each transmission route, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransmissionShares {
    pub cow_cow: f64,
    pub cow_badger: f64,
    pub badger_cow: f64,
    pub badger_badger: f64,
}

/// Time series of one replicate, one comma-terminated line per quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesLines {
    pub infected_herds: String,
    pub restricted_herds: String,
    pub infected_cows: String,
    pub infected_reservoirs: String,
    pub infected_badgers: String,
}

impl From<&OutbreakSeries> for SeriesLines {
    fn from(series: &OutbreakSeries) -> Self {
        Self {
            infected_herds: series_line(&series.infected_herds),
            restricted_herds: series_line(&series.restricted_herds),
            infected_cows: series_line(&series.infected_cows),
            infected_reservoirs: series_line(&series.infected_reservoirs),
            infected_badgers: series_line(&series.infected_badgers),
        }
    }
}

/// Replicates of one parameter set joined together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub n_scenarios: usize,
    /// Mean over finite scores, `-inf` when there are none.
    pub log_likelihood: f64,
    pub log_likelihood_stats: AccumulatorReport,
    pub n_rejected_scores: usize,
    pub n_contained: usize,
    pub n_too_large: usize,
    pub n_rejected_runs: usize,
    pub counts: CountsReport,
    pub transmissions: TransmissionCounts,
    pub transmission_shares: TransmissionShares,
    pub distances: IntegerDistribution,
    pub reactors: IntegerDistribution,
    pub series: Vec<SeriesLines>,
}

impl Summary {
    pub fn join(results: &[ScenarioResults]) -> Self {
        let mut log_likelihood = Accumulator::new();
        let mut counts: [Accumulator; 10] = Default::default();
        let mut transmissions = TransmissionCounts::default();
        let mut distances = IntegerDistribution::new();
        let mut reactors = IntegerDistribution::new();
        let mut n_rejected_scores = 0;
        let mut n_contained = 0;
        let mut n_too_large = 0;
        let mut n_rejected_runs = 0;

        for result in results {
            if result.log_likelihood.is_finite() {
                log_likelihood.add(result.log_likelihood);
            } else {
                n_rejected_scores += 1;
            }
            match result.outcome {
                Outcome::Completed => {}
                Outcome::Contained => n_contained += 1,
                Outcome::TooLarge => n_too_large += 1,
            }
            n_rejected_runs += result.n_rejected_runs;

            let c = &result.counts;
            let vals = [
                c.cows_infected,
                c.badgers_infected,
                c.cows_moved,
                c.badgers_moved,
                c.infected_cows_moved,
                c.infected_badgers_moved,
                c.cows_culled,
                c.infected_cows_at_slaughter,
                c.infected_badgers_dead,
                result.outbreak_size as u64,
            ];
            for (acc, val) in counts.iter_mut().zip(vals) {
                acc.add(val as f64);
            }

            let t = &result.transmissions;
            transmissions.cow_cow += t.cow_cow;
            transmissions.cow_badger += t.cow_badger;
            transmissions.badger_cow += t.badger_cow;
            transmissions.badger_badger += t.badger_badger;

            distances.merge(&result.distances);
            reactors.merge(&result.reactors);
        }

        let [
            cows_infected,
            badgers_infected,
            cows_moved,
            badgers_moved,
            infected_cows_moved,
            infected_badgers_moved,
            cows_culled,
            infected_cows_at_slaughter,
            infected_badgers_dead,
            outbreak_size,
        ] = counts.map(|acc| acc.report());

        let total = transmissions.total();
        let log_likelihood_stats = log_likelihood.report();
        Self {
            n_scenarios: results.len(),
            log_likelihood: if log_likelihood.n_vals() > 0 {
                log_likelihood_stats.mean
            } else {
                f64::NEG_INFINITY
            },
            log_likelihood_stats,
            n_rejected_scores,
            n_contained,
            n_too_large,
            n_rejected_runs,
            counts: CountsReport {
                cows_infected,
                badgers_infected,
                cows_moved,
                badgers_moved,
                infected_cows_moved,
                infected_badgers_moved,
                cows_culled,
                infected_cows_at_slaughter,
                infected_badgers_dead,
                outbreak_size,
            },
            transmissions,
            transmission_shares: TransmissionShares {
                cow_cow: percentage(transmissions.cow_cow, total),
                cow_badger: percentage(transmissions.cow_badger, total),
                badger_cow: percentage(transmissions.badger_cow, total),
                badger_badger: percentage(transmissions.badger_badger, total),
            },
            distances,
            reactors,
            series: results.iter().map(|r| SeriesLines::from(&r.series)).collect(),
        }
    }
}
