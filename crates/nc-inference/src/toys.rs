//! Toy dataset generation.
//!
//! Sampling is deterministic: toy `i` of a generator with base seed `s` is drawn
//! from `StdRng::seed_from_u64(s + i)`, independent of which worker thread runs it
//! or in which order. Independent sub-streams (one per scan point, one for the
//! expected-band ensemble) are derived with [`ToyGenerator::stream`].

use nc_core::{CountPolicy, Dataset, Error, ParameterPoint, ParametricModel, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Gamma, LogNormal, Normal};
use serde::{Deserialize, Serialize};

/// SplitMix64 finaliser, used to decorrelate derived stream seeds.
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Prior used to smear a nuisance parameter per toy (hybrid toys).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NuisancePrior {
    /// Gamma with `shape` and `scale`. The posterior of `b` from an off-count `y`
    /// with a flat prior is `Gamma(y + 1, 1 / tau)`.
    Gamma {
        /// Shape `k`.
        shape: f64,
        /// Scale `θ`.
        scale: f64,
    },
    /// Normal, truncated to the parameter range.
    Gaussian {
        /// Mean.
        mean: f64,
        /// Width.
        sigma: f64,
    },
    /// Log-normal: `ln X ~ N(mu, sigma)`.
    LogNormal {
        /// Location of `ln X`.
        mu: f64,
        /// Scale of `ln X`.
        sigma: f64,
    },
}

impl NuisancePrior {
    fn validate(&self) -> Result<()> {
        let ok = match *self {
            NuisancePrior::Gamma { shape, scale } => shape > 0.0 && scale > 0.0,
            NuisancePrior::Gaussian { sigma, mean } => sigma > 0.0 && mean.is_finite(),
            NuisancePrior::LogNormal { sigma, mu } => sigma > 0.0 && mu.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!("invalid nuisance prior {self:?}")))
        }
    }

    /// Draw inside `[lo, hi]` by rejection.
    fn sample_in(&self, (lo, hi): (f64, f64), rng: &mut dyn RngCore) -> Result<f64> {
        const MAX_ATTEMPTS: usize = 10_000;
        let draw = |rng: &mut dyn RngCore| -> Result<f64> {
            Ok(match *self {
                NuisancePrior::Gamma { shape, scale } => Gamma::new(shape, scale)
                    .map_err(|e| Error::Validation(format!("gamma prior: {e}")))?
                    .sample(rng),
                NuisancePrior::Gaussian { mean, sigma } => Normal::new(mean, sigma)
                    .map_err(|e| Error::Validation(format!("gaussian prior: {e}")))?
                    .sample(rng),
                NuisancePrior::LogNormal { mu, sigma } => LogNormal::new(mu, sigma)
                    .map_err(|e| Error::Validation(format!("log-normal prior: {e}")))?
                    .sample(rng),
            })
        };
        for _ in 0..MAX_ATTEMPTS {
            let v = draw(rng)?;
            if v >= lo && v <= hi {
                return Ok(v);
            }
        }
        Err(Error::ModelEvaluation(format!(
            "prior {self:?} has negligible mass in [{lo}, {hi}]"
        )))
    }
}

/// Seeded toy dataset generator.
#[derive(Debug, Clone)]
pub struct ToyGenerator {
    policy: CountPolicy,
    seed: u64,
    priors: Vec<(usize, NuisancePrior)>,
}

impl ToyGenerator {
    /// Generator with a fixed base seed.
    pub fn new(policy: CountPolicy, seed: u64) -> Self {
        Self { policy, seed, priors: Vec::new() }
    }

    /// Generator seeded from the seed if given, else from the thread RNG.
    pub fn from_optional_seed(policy: CountPolicy, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| rand::rng().random::<u64>());
        Self::new(policy, seed)
    }

    /// Smear parameter `index` with `prior` before every toy.
    pub fn with_prior(mut self, index: usize, prior: NuisancePrior) -> Result<Self> {
        prior.validate()?;
        self.priors.retain(|(i, _)| *i != index);
        self.priors.push((index, prior));
        Ok(self)
    }

    /// Base seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Entry-count policy.
    pub fn policy(&self) -> CountPolicy {
        self.policy
    }

    /// Independent sub-stream `id` (same policy and priors).
    pub fn stream(&self, id: u64) -> Self {
        let seed = splitmix64(self.seed ^ splitmix64(id));
        Self { policy: self.policy, seed, priors: self.priors.clone() }
    }

    /// RNG for toy `index`.
    pub fn rng_for(&self, index: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(index))
    }

    /// Check that the configured priors address nuisance parameters of `model`.
    pub fn validate_for(&self, model: &dyn ParametricModel) -> Result<()> {
        for (i, _) in &self.priors {
            if *i >= model.dim() {
                return Err(Error::Validation(format!(
                    "prior on parameter {i}, model has {} parameters",
                    model.dim()
                )));
            }
            if *i == model.poi_index() {
                return Err(Error::Validation("priors apply to nuisance parameters only".into()));
            }
        }
        Ok(())
    }

    /// Generate toy `index` at `point`.
    pub fn generate(
        &self,
        model: &dyn ParametricModel,
        point: &ParameterPoint,
        index: u64,
    ) -> Result<Dataset> {
        let mut rng = self.rng_for(index);
        if self.priors.is_empty() {
            return model.sample(point.values(), self.policy, &mut rng);
        }
        let specs = model.parameters();
        let mut values = point.values().to_vec();
        for &(i, prior) in &self.priors {
            let spec = specs.get(i).ok_or_else(|| {
                Error::Validation(format!("prior on unknown parameter index {i}"))
            })?;
            values[i] = prior.sample_in(spec.bounds, &mut rng)?;
        }
        model.sample(&values, self.policy, &mut rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::ParameterSpec;
    use nc_model::{GaussianMeanModel, OnOffModel};

    fn on_off() -> OnOffModel {
        OnOffModel::new(
            1.0,
            ParameterSpec::new("s", 0.0, 0.0, 100.0).unwrap(),
            ParameterSpec::new("b", 100.0, 0.0, 300.0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_toys_reproducible() {
        let m = on_off();
        let p = m.nominal_point().unwrap();
        let g = ToyGenerator::new(CountPolicy::NumberCounting, 123);
        let a: Vec<_> = (0..5).map(|i| g.generate(&m, &p, i).unwrap()).collect();
        let b: Vec<_> = (0..5).rev().map(|i| g.generate(&m, &p, i).unwrap()).collect();
        let b: Vec<_> = b.into_iter().rev().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_streams_differ() {
        let g = ToyGenerator::new(CountPolicy::NumberCounting, 7);
        assert_ne!(g.stream(1).seed(), g.stream(2).seed());
        assert_eq!(g.stream(1).seed(), g.stream(1).seed());
        assert_ne!(g.stream(0).seed(), g.seed());
    }

    #[test]
    fn test_unseeded_generators_differ() {
        let a = ToyGenerator::from_optional_seed(CountPolicy::NumberCounting, None);
        let b = ToyGenerator::from_optional_seed(CountPolicy::NumberCounting, None);
        assert_ne!(a.seed(), b.seed());
        let c = ToyGenerator::from_optional_seed(CountPolicy::NumberCounting, Some(5));
        assert_eq!(c.seed(), 5);
    }

    #[test]
    fn test_fixed_count_policy_respected() {
        let m = GaussianMeanModel::new(
            ParameterSpec::new("mu", 0.0, -1.0, 1.0).unwrap(),
            1.0,
            (-10.0, 10.0),
        )
        .unwrap();
        let p = m.nominal_point().unwrap();
        let g = ToyGenerator::new(CountPolicy::FixedCount(37), 1);
        for i in 0..10 {
            assert_eq!(g.generate(&m, &p, i).unwrap().n_entries(), 37);
        }
    }

    #[test]
    fn test_gamma_prior_widens_off_counts() {
        // With a prior on b, the on-count variance gains Var(b) on top of E[b].
        let m = on_off();
        let p = m.point(vec![0.0, 100.0]).unwrap();
        let plain = ToyGenerator::new(CountPolicy::NumberCounting, 99);
        let hybrid = ToyGenerator::new(CountPolicy::NumberCounting, 99)
            .with_prior(1, NuisancePrior::Gamma { shape: 101.0, scale: 1.0 })
            .unwrap();
        let var = |g: &ToyGenerator| {
            let xs: Vec<f64> = (0..4000).map(|i| g.generate(&m, &p, i).unwrap().entry(0)[0]).collect();
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
        };
        // ≈ 100 vs ≈ 202
        let (v_plain, v_hybrid) = (var(&plain), var(&hybrid));
        assert!(v_hybrid > 1.5 * v_plain, "{v_plain} vs {v_hybrid}");
    }

    #[test]
    fn test_prior_validation() {
        let m = on_off();
        let g = ToyGenerator::new(CountPolicy::NumberCounting, 1);
        assert!(g.clone().with_prior(1, NuisancePrior::Gamma { shape: -1.0, scale: 1.0 }).is_err());
        let on_poi = g.with_prior(0, NuisancePrior::Gaussian { mean: 1.0, sigma: 1.0 }).unwrap();
        assert!(on_poi.validate_for(&m).is_err());
    }
}
