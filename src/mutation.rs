use crate::model::Animal;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::Poisson;
use serde::{Deserialize, Serialize};

/// Infinite-alleles mutation source.
///
/// Every SNP handed out carries a fresh id, so ids are unique within the
/// scenario that owns the clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnpClock {
    last_snp: u32,
}

impl SnpClock {
    /// Generate the SNPs accumulated between `last_day` and `day`.
    ///
    /// A negative `rate` selects seed mode, which yields exactly
    /// `max(day, 1)` SNPs regardless of `last_day`.
    pub fn generate<R: Rng + ?Sized>(
        &mut self,
        rate: f64,
        day: i32,
        last_day: i32,
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        let n_snps = if rate < 0.0 {
            day.max(1) as u64
        } else {
            let n_days = day - last_day;
            if n_days < 0 {
                bail!("mutation step goes back in time from day {last_day} to day {day}");
            }
            let lambda = rate * n_days as f64;
            if lambda > 0.0 {
                let dist =
                    Poisson::new(lambda).context("failed to construct poisson distribution")?;
                let n_snps: f64 = dist.sample(rng);
                n_snps as u64
            } else {
                0
            }
        };

        Ok((0..n_snps)
            .map(|_| {
                self.last_snp += 1;
                self.last_snp
            })
            .collect())
    }

    /// Bring `animal`'s SNP set up to date at `day`.
    pub fn advance<R: Rng + ?Sized>(
        &mut self,
        animal: &mut Animal,
        rate: f64,
        day: i32,
        rng: &mut R,
    ) -> Result<()> {
        let snps = self
            .generate(rate, day, animal.last_snp_day, rng)
            .with_context(|| format!("failed to update snps of {}", animal.id))?;
        animal.snps.extend(snps);
        animal.last_snp_day = day;
        Ok(())
    }
}
