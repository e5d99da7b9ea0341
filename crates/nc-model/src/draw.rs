//! Random draws shared by the model samplers.

use nc_core::{CountPolicy, Error, Result};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal, Poisson};

/// Draw a Poisson count; a non-positive mean is deterministically 0.
pub(crate) fn poisson(lambda: f64, rng: &mut dyn RngCore) -> Result<f64> {
    if !lambda.is_finite() {
        return Err(Error::ModelEvaluation(format!("Poisson mean {lambda} is not finite")));
    }
    if lambda <= 0.0 {
        return Ok(0.0);
    }
    let pois = Poisson::new(lambda)
        .map_err(|e| Error::ModelEvaluation(format!("Poisson({lambda}): {e}")))?;
    Ok(pois.sample(rng))
}

/// Draw from `N(mean, sigma)` restricted to `[lo, hi]` by rejection.
pub(crate) fn truncated_normal(
    mean: f64,
    sigma: f64,
    (lo, hi): (f64, f64),
    rng: &mut dyn RngCore,
) -> Result<f64> {
    const MAX_ATTEMPTS: usize = 10_000;
    let normal = Normal::new(mean, sigma)
        .map_err(|e| Error::ModelEvaluation(format!("Normal({mean}, {sigma}): {e}")))?;
    for _ in 0..MAX_ATTEMPTS {
        let x = normal.sample(rng);
        if x >= lo && x <= hi {
            return Ok(x);
        }
    }
    Err(Error::ModelEvaluation(format!(
        "N({mean}, {sigma}) has negligible mass in [{lo}, {hi}]"
    )))
}

/// Uniform draw on `[lo, hi)`.
pub(crate) fn uniform(lo: f64, hi: f64, rng: &mut dyn RngCore) -> f64 {
    lo + (hi - lo) * rng.random::<f64>()
}

/// Counting models produce exactly one entry per dataset.
pub(crate) fn require_single_entry(model: &str, policy: CountPolicy) -> Result<()> {
    match policy {
        CountPolicy::NumberCounting | CountPolicy::FixedCount(1) => Ok(()),
        CountPolicy::Extended => Err(Error::Validation(format!(
            "{model}: number-counting model cannot be extended"
        ))),
        CountPolicy::FixedCount(n) => Err(Error::Validation(format!(
            "{model}: number-counting model generates one entry, requested {n}"
        ))),
    }
}

/// Entry count for an unbinned model.
pub(crate) fn unbinned_count(
    model: &str,
    policy: CountPolicy,
    expected: Option<f64>,
    rng: &mut dyn RngCore,
) -> Result<usize> {
    match policy {
        CountPolicy::FixedCount(n) => Ok(n),
        CountPolicy::Extended => {
            let nu = expected.ok_or_else(|| {
                Error::Validation(format!("{model}: no expected yield, cannot be extended"))
            })?;
            Ok(poisson(nu, rng)? as usize)
        }
        CountPolicy::NumberCounting => Err(Error::Validation(format!(
            "{model}: unbinned model does not support number-counting generation"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_poisson_zero_mean() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(poisson(0.0, &mut rng).unwrap(), 0.0);
        assert!(poisson(f64::NAN, &mut rng).is_err());
    }

    #[test]
    fn test_truncated_normal_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let x = truncated_normal(0.0, 1.0, (-0.5, 0.5), &mut rng).unwrap();
            assert!((-0.5..=0.5).contains(&x));
        }
        assert!(truncated_normal(0.0, 1.0, (50.0, 51.0), &mut rng).is_err());
    }

    #[test]
    fn test_policy_checks() {
        assert!(require_single_entry("m", CountPolicy::NumberCounting).is_ok());
        assert!(require_single_entry("m", CountPolicy::FixedCount(1)).is_ok());
        assert!(require_single_entry("m", CountPolicy::Extended).is_err());
        assert!(require_single_entry("m", CountPolicy::FixedCount(3)).is_err());

        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(unbinned_count("m", CountPolicy::FixedCount(5), None, &mut rng).unwrap(), 5);
        assert!(unbinned_count("m", CountPolicy::Extended, None, &mut rng).is_err());
        assert!(unbinned_count("m", CountPolicy::NumberCounting, Some(3.0), &mut rng).is_err());
    }
}
