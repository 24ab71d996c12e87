use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::{Hypergeometric, weighted::WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Frequency table over non-negative integer bins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegerDistribution {
    counts: BTreeMap<u32, u64>,
}

impl IntegerDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_count(&mut self, bin: u32, n: u64) {
        *self.counts.entry(bin).or_insert(0) += n;
    }

    pub fn frequency(&self, bin: u32) -> u64 {
        self.counts.get(&bin).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn bins(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.counts.iter().map(|(&bin, &freq)| (bin, freq))
    }

    /// Draw a bin with probability proportional to its frequency.
    ///
    /// Returns `None` when the table holds no mass.
    pub fn random_bin<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u32> {
        let (bins, freqs): (Vec<u32>, Vec<u64>) =
            self.counts.iter().filter(|&(_, &f)| f > 0).unzip();
        let index = WeightedIndex::new(&freqs).ok()?;
        Some(bins[index.sample(rng)])
    }

    pub fn retain_bins<F: FnMut(u32) -> bool>(&mut self, mut keep: F) {
        self.counts.retain(|&bin, _| keep(bin));
    }

    pub fn merge(&mut self, other: &IntegerDistribution) {
        for (bin, freq) in other.bins() {
            self.add_count(bin, freq);
        }
    }
}

/// Rescale `counts` so they sum exactly to `target`.
///
/// Uses largest-remainder rounding; ties go to the lower index.
pub fn rescale_counts(counts: &[u64], target: u64) -> Vec<u64> {
    let total: u128 = counts.iter().map(|&c| c as u128).sum();
    if total == 0 {
        return vec![0; counts.len()];
    }

    let mut scaled = Vec::with_capacity(counts.len());
    let mut remainders = Vec::with_capacity(counts.len());
    for (idx, &count) in counts.iter().enumerate() {
        let product = count as u128 * target as u128;
        scaled.push((product / total) as u64);
        remainders.push((product % total, idx));
    }

    let assigned: u64 = scaled.iter().sum();
    let leftover = (target - assigned) as usize;
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(_, idx) in remainders.iter().take(leftover) {
        scaled[idx] += 1;
    }

    scaled
}

/// Number of marked items in `draws` items taken without replacement
/// from `population` items of which `marked` are marked.
pub fn sample_hypergeometric<R: Rng + ?Sized>(
    population: u64,
    draws: u64,
    marked: u64,
    rng: &mut R,
) -> Result<u64> {
    if marked > population {
        bail!("{marked} marked items exceed population of {population}");
    }
    if draws > population {
        bail!("{draws} draws exceed population of {population}");
    }
    if draws == 0 || marked == 0 {
        return Ok(0);
    }
    if marked == population {
        return Ok(draws);
    }
    if draws == population {
        return Ok(marked);
    }
    let dist = Hypergeometric::new(population, marked, draws)
        .context("failed to construct hypergeometric distribution")?;
    Ok(dist.sample(rng))
}

/// Natural log of `n!`.
pub fn ln_factorial(n: u64) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha12Rng;

    #[test]
    fn rescaled_counts_keep_target_total() {
        let scaled = rescale_counts(&[1, 1, 1], 10);
        assert_eq!(scaled.iter().sum::<u64>(), 10);
        assert_eq!(scaled, vec![4, 3, 3]);

        let scaled = rescale_counts(&[5, 0, 15], 4);
        assert_eq!(scaled, vec![1, 0, 3]);

        assert_eq!(rescale_counts(&[0, 0], 7), vec![0, 0]);
    }

    #[test]
    fn random_bin_only_returns_weighted_bins() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let mut dist = IntegerDistribution::new();
        assert_eq!(dist.random_bin(&mut rng), None);

        dist.add_count(3, 2);
        dist.add_count(9, 0);
        dist.add_count(12, 5);
        for _ in 0..200 {
            let bin = dist.random_bin(&mut rng).unwrap();
            assert!(bin == 3 || bin == 12);
        }
    }

    #[test]
    fn hypergeometric_stays_within_support() {
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let mut zero_draws = 0;
        let n_trials = 20_000;
        for _ in 0..n_trials {
            let k = sample_hypergeometric(5, 3, 2, &mut rng).unwrap();
            assert!(k <= 2);
            if k == 0 {
                zero_draws += 1;
            }
        }
        // P(0) = C(3,3) / C(5,3) = 1/10
        let p_zero = zero_draws as f64 / n_trials as f64;
        assert!((p_zero - 0.1).abs() < 0.015, "p_zero = {p_zero}");
    }

    #[test]
    fn hypergeometric_rejects_impossible_parameters() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        assert!(sample_hypergeometric(4, 2, 5, &mut rng).is_err());
        assert!(sample_hypergeometric(4, 6, 1, &mut rng).is_err());
        assert_eq!(sample_hypergeometric(4, 4, 4, &mut rng).unwrap(), 4);
    }

    #[test]
    fn ln_factorial_matches_small_values() {
        assert_eq!(ln_factorial(0), 0.0);
        assert_eq!(ln_factorial(1), 0.0);
        assert!((ln_factorial(5) - 120f64.ln()).abs() < 1e-12);
    }
}
