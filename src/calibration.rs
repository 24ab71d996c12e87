//! Random-walk Metropolis calibration of the model parameters.

use crate::config::{CalibrationConfig, Config, Params, Prior};
use crate::input::Landscape;
use crate::results::Summary;
use crate::scenario::run_replicates;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// Normal draws tried before a proposal is clamped into its prior.
const MAX_PROPOSAL_DRAWS: usize = 1000;

/// Decimal places kept in proposed values.
const PROPOSAL_SCALE: f64 = 1e4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub index: usize,
    pub params: Params,
    pub log_likelihood: f64,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResults {
    pub steps: Vec<ChainStep>,
    /// Parameters of the last accepted step.
    pub params: Params,
    /// Summary of the last accepted step.
    pub summary: Summary,
}

/// Propose new values for the calibrated parameters.
///
/// Each value is drawn from a normal around the current one, truncated to
/// the prior bounds, and rounded to four decimal places.
pub fn propose<R: Rng + ?Sized>(
    priors: &[Prior],
    current: &Params,
    rng: &mut R,
) -> Result<Params> {
    let mut proposal = *current;
    for prior in priors {
        let value = current.get(prior.name);
        let dist = Normal::new(value, prior.std_dev)
            .with_context(|| format!("failed to construct proposal of {:?}", prior.name))?;
        let drawn = (0..MAX_PROPOSAL_DRAWS)
            .map(|_| dist.sample(rng))
            .find(|v| (prior.min..=prior.max).contains(v))
            .unwrap_or(value);
        let rounded = (drawn * PROPOSAL_SCALE).round() / PROPOSAL_SCALE;
        proposal.set(prior.name, rounded.clamp(prior.min, prior.max));
    }
    Ok(proposal)
}

/// Metropolis acceptance on log-likelihoods scaled by `smoothing_ratio`.
///
/// A finite proposal is always taken over a rejected (`-inf`) current
/// step, and a non-finite proposal is never taken.
pub fn accept<R: Rng + ?Sized>(old: f64, new: f64, smoothing_ratio: f64, rng: &mut R) -> bool {
    if !new.is_finite() {
        return false;
    }
    if !old.is_finite() {
        return true;
    }
    let u: f64 = rng.random();
    u.ln() < (new - old) / smoothing_ratio
}

/// Run the chain from the priors' initial values.
///
/// Every step runs the configured number of replicates; replicate seeds are
/// drawn from the chain's own stream.
pub fn run_chain(
    landscape: &Landscape,
    cfg: &Config,
    calibration: &CalibrationConfig,
    seed: u64,
) -> Result<ChainResults> {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    rng.set_stream(1);

    let mut params = cfg.model;
    for prior in &calibration.priors {
        params.set(prior.name, prior.initial);
    }

    let evaluate = |params: Params, rng: &mut ChaCha12Rng| -> Result<Summary> {
        let results = run_replicates(landscape, cfg, params, rng.random())?;
        Ok(Summary::join(&results))
    };

    let mut summary = evaluate(params, &mut rng).context("failed to evaluate initial step")?;
    let mut steps = vec![ChainStep {
        index: 0,
        params,
        log_likelihood: summary.log_likelihood,
        accepted: true,
    }];
    log::info!("initial log-likelihood {:.4}", summary.log_likelihood);

    for index in 1..=calibration.n_steps {
        let proposal = propose(&calibration.priors, &params, &mut rng)?;
        let proposed = evaluate(proposal, &mut rng)
            .with_context(|| format!("failed to evaluate step {index}"))?;
        let accepted = accept(
            summary.log_likelihood,
            proposed.log_likelihood,
            calibration.smoothing_ratio,
            &mut rng,
        );
        steps.push(ChainStep {
            index,
            params: proposal,
            log_likelihood: proposed.log_likelihood,
            accepted,
        });
        if accepted {
            params = proposal;
            summary = proposed;
        }

        let progress = 100.0 * index as f64 / calibration.n_steps as f64;
        log::info!(
            "completed {progress:06.2}% (log-likelihood {:.4}, accepted {accepted})",
            steps[index].log_likelihood
        );
    }

    let n_accepted = steps.iter().filter(|step| step.accepted).count();
    log::info!("accepted {n_accepted} of {} steps", steps.len());

    Ok(ChainResults {
        steps,
        params,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamName;
    use crate::config::tests::sample_config;
    use crate::scenario::tests::landscape;

    fn prior(name: ParamName, min: f64, max: f64, std_dev: f64) -> Prior {
        Prior {
            name,
            min,
            max,
            initial: min,
            std_dev,
        }
    }

    #[test]
    fn proposals_stay_inside_priors() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let priors = [
            prior(ParamName::BetaCc, 0.0, 0.01, 1.0),
            prior(ParamName::Gamma, 0.2, 0.4, 0.05),
        ];
        let mut params = sample_config().model;
        params.gamma = 0.3;
        for _ in 0..500 {
            let proposal = propose(&priors, &params, &mut rng).unwrap();
            assert!((0.0..=0.01).contains(&proposal.beta_cc));
            assert!((0.2..=0.4).contains(&proposal.gamma));
            let scaled = proposal.gamma * PROPOSAL_SCALE;
            assert!((scaled - scaled.round()).abs() < 1e-6);
            assert_eq!(proposal.sigma, params.sigma);
            params = proposal;
        }
    }

    #[test]
    fn acceptance_follows_metropolis_rule() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        assert!(accept(f64::NEG_INFINITY, -100.0, 1.0, &mut rng));
        assert!(!accept(-1.0, f64::NEG_INFINITY, 1.0, &mut rng));
        assert!(!accept(f64::NEG_INFINITY, f64::NEG_INFINITY, 1.0, &mut rng));
        for _ in 0..100 {
            assert!(accept(-10.0, -5.0, 1.0, &mut rng));
        }

        let n_accepted = (0..10_000)
            .filter(|_| accept(-10.0, -10.0 - 2f64.ln(), 1.0, &mut rng))
            .count();
        assert!((4_500..5_500).contains(&n_accepted), "{n_accepted}");

        // a larger smoothing ratio accepts worse steps more often
        let n_smoothed = (0..10_000)
            .filter(|_| accept(-10.0, -10.0 - 2f64.ln(), 4.0, &mut rng))
            .count();
        assert!(n_smoothed > n_accepted);
    }

    #[test]
    fn chain_records_every_step() {
        let landscape = landscape(2, 10);
        let mut cfg = sample_config();
        cfg.simulation.end_date = 10;
        let calibration = CalibrationConfig {
            n_steps: 3,
            smoothing_ratio: 1.0,
            priors: vec![Prior {
                name: ParamName::BetaCc,
                min: 0.0,
                max: 0.5,
                initial: 0.1,
                std_dev: 0.05,
            }],
        };

        let chain = run_chain(&landscape, &cfg, &calibration, 12).unwrap();
        assert_eq!(chain.steps.len(), 4);
        assert_eq!(chain.steps[0].params.beta_cc, 0.1);
        assert!(chain.steps[0].accepted);
        let last_accepted = chain.steps.iter().rev().find(|s| s.accepted).unwrap();
        assert_eq!(chain.params, last_accepted.params);
        assert_eq!(chain.summary.n_scenarios, cfg.simulation.n_scenarios);
    }
}
