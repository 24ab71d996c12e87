use crate::kernel::TransitionKernel;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::Poisson;

/// Decides how many times each kernel event fires over one step.
pub trait StochasticDriver {
    /// Return `(event index, fire count)` pairs with a non-zero count.
    fn leap<R: Rng + ?Sized>(
        &mut self,
        kernel: &TransitionKernel,
        rng: &mut R,
    ) -> Result<Vec<(usize, u64)>>;
}

/// Fixed-step tau leaping: each event fires Poisson(rate * tau) times.
#[derive(Debug, Clone)]
pub struct TauLeapFixedStep {
    tau: f64,
}

impl TauLeapFixedStep {
    pub fn new(tau: f64) -> Self {
        Self { tau }
    }
}

impl StochasticDriver for TauLeapFixedStep {
    fn leap<R: Rng + ?Sized>(
        &mut self,
        kernel: &TransitionKernel,
        rng: &mut R,
    ) -> Result<Vec<(usize, u64)>> {
        let mut fired = Vec::new();
        for (idx, (event, rate)) in kernel.entries().iter().enumerate() {
            let lambda = rate * self.tau;
            if lambda <= 0.0 {
                continue;
            }
            let dist = Poisson::new(lambda)
                .with_context(|| format!("invalid rate {rate} for {event:?}"))?;
            let n_times: f64 = dist.sample(rng);
            if n_times > 0.0 {
                fired.push((idx, n_times as u64));
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{farm, params, seed};
    use crate::model::{CowState, Disease, Population};
    use rand_chacha::ChaCha12Rng;

    #[test]
    fn fire_counts_match_poisson_mean() {
        let mut pop = Population::default();
        pop.farms.insert("F1".to_string(), farm("F1", 10, &[]));
        seed(&mut pop, "Cow_1", "F1", Disease::Cow(CowState::Infectious));
        let kernel = TransitionKernel::build(&pop, &params(), false);

        let mut driver = TauLeapFixedStep::new(2.0);
        let mut rng = ChaCha12Rng::seed_from_u64(21);
        let n_leaps = 5_000;
        let mut total = 0;
        for _ in 0..n_leaps {
            for (idx, n_times) in driver.leap(&kernel, &mut rng).unwrap() {
                assert_eq!(idx, 0);
                assert!(n_times > 0);
                total += n_times;
            }
        }
        // rate 0.9 over 2 days
        let mean = total as f64 / n_leaps as f64;
        assert!((mean - 1.8).abs() < 0.08, "mean = {mean}");
    }

    #[test]
    fn empty_kernel_fires_nothing() {
        let mut driver = TauLeapFixedStep::new(1.0);
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let fired = driver.leap(&TransitionKernel::default(), &mut rng).unwrap();
        assert!(fired.is_empty());
    }
}
