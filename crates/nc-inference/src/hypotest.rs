//! Toy-based hypothesis tests at a single POI value.
//!
//! The null sampling distribution is built at `null_point`; the p-value is the
//! fraction of toys at least as extreme as the observed statistic. Nuisance
//! priors on the [`ToyGenerator`] turn this into the hybrid
//! (Bayesian-frequentist) test.

use crate::sampling::{SamplingDistribution, SamplingDistributionBuilder, ToyCounts};
use crate::test_statistic::TestStatistic;
use crate::toys::ToyGenerator;
use nc_core::{CancellationToken, Dataset, Error, ParameterPoint, ParametricModel, Result};
use nc_prob::normal;
use serde::{Deserialize, Serialize};

/// Stream id of the alternative ensemble.
const ALT_STREAM: u64 = u64::MAX - 1;

/// Result of a toy-based hypothesis test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyHypotestResult {
    /// Tested POI value.
    pub poi: f64,
    /// Observed statistic.
    pub t_observed: f64,
    /// `P(t >= t_obs | null)`.
    pub p_value: f64,
    /// `P(t > t_obs | null)`.
    pub p_value_strict: f64,
    /// Binomial standard error of `p_value`.
    pub p_value_error: f64,
    /// One-sided significance of `p_value`.
    pub significance: f64,
    /// Null ensemble bookkeeping.
    pub null_counts: ToyCounts,
    /// `P(t >= t_obs | alt)`, when an alternative was given.
    pub alt_tail: Option<f64>,
    /// Alternative ensemble bookkeeping.
    pub alt_counts: Option<ToyCounts>,
    /// Cancellation stopped an ensemble early.
    pub partial: bool,
}

/// Toy hypothesis test runner.
pub struct ToyHypotest<'a> {
    model: &'a dyn ParametricModel,
    test_stat: &'a dyn TestStatistic,
    toys: &'a ToyGenerator,
    alternative: Option<(&'a ParameterPoint, usize)>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> ToyHypotest<'a> {
    /// Runner over `model` and `test_stat` drawing toys from `toys`.
    pub fn new(
        model: &'a dyn ParametricModel,
        test_stat: &'a dyn TestStatistic,
        toys: &'a ToyGenerator,
    ) -> Self {
        Self { model, test_stat, toys, alternative: None, cancel: None }
    }

    /// Also build `n_toys` toys at `point` and report the alternative tail.
    pub fn with_alternative(mut self, point: &'a ParameterPoint, n_toys: usize) -> Self {
        self.alternative = Some((point, n_toys));
        self
    }

    /// Stop dispatching toys once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn ensemble(
        &self,
        toys: &ToyGenerator,
        point: &ParameterPoint,
        poi: f64,
        n_toys: usize,
    ) -> Result<SamplingDistribution> {
        let mut builder = SamplingDistributionBuilder::new(self.model, self.test_stat, toys);
        if let Some(c) = self.cancel {
            builder = builder.with_cancellation(c);
        }
        builder.build_evaluated_at(point, poi, n_toys)
    }

    /// Test `observed` against `n_toys` toys generated at `null_point`.
    pub fn run(
        &self,
        null_point: &ParameterPoint,
        observed: &Dataset,
        n_toys: usize,
    ) -> Result<ToyHypotestResult> {
        if n_toys == 0 {
            return Err(Error::Validation("n_toys must be > 0".into()));
        }
        self.toys.validate_for(self.model)?;
        let poi = null_point.poi_value();
        let t_obs = self.test_stat.evaluate(self.model, observed, poi)?;
        if !t_obs.converged {
            log::warn!("observed fit at POI = {poi} did not converge");
        }
        let t_observed = t_obs.value;

        let null = self.ensemble(self.toys, null_point, poi, n_toys)?;
        if null.n_valid() == 0 {
            return Err(Error::Computation(format!(
                "no valid null toys at POI = {poi} ({} failed)",
                null.counts().n_failed()
            )));
        }
        let p_value = null.tail_probability(t_observed, true);
        let p_value_strict = null.tail_probability(t_observed, false);
        let n = null.n_valid() as f64;
        let p_value_error = (p_value * (1.0 - p_value) / n).sqrt();
        let significance = normal::pvalue_to_significance(p_value)?;

        let mut partial = null.cancelled();
        let (alt_tail, alt_counts) = match self.alternative {
            Some((alt_point, n_alt)) => {
                let alt_stream = self.toys.stream(ALT_STREAM);
                let alt = self.ensemble(&alt_stream, alt_point, poi, n_alt)?;
                partial |= alt.cancelled();
                (Some(alt.tail_probability(t_observed, true)), Some(*alt.counts()))
            }
            None => (None, None),
        };

        log::info!(
            "toy hypotest at POI = {poi}: t_obs = {t_observed:.4}, p = {p_value:.3e} ± {p_value_error:.1e}, Z = {significance:.3}"
        );

        Ok(ToyHypotestResult {
            poi,
            t_observed,
            p_value,
            p_value_strict,
            p_value_error,
            significance,
            null_counts: *null.counts(),
            alt_tail,
            alt_counts,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_statistic::NumEvents;
    use nc_core::{CountPolicy, ParameterSpec};
    use nc_model::PoissonCountModel;
    use nc_prob::poisson;

    fn model() -> PoissonCountModel {
        PoissonCountModel::new(3.0, ParameterSpec::new("mu", 0.0, 0.0, 15.0).unwrap()).unwrap()
    }

    #[test]
    fn test_counting_p_value_matches_poisson_tail() {
        let m = model();
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 21);
        let observed = Dataset::counts(vec![7.0]).unwrap();
        let null = m.point(vec![0.0]).unwrap();
        let r = ToyHypotest::new(&m, &NumEvents, &toys).run(&null, &observed, 20_000).unwrap();
        let exact = poisson::sf_inclusive(7, 3.0).unwrap();
        assert!((r.p_value - exact).abs() < 4.0 * r.p_value_error, "{} vs {exact}", r.p_value);
        assert!(r.p_value_strict < r.p_value);
        assert!(r.significance > 1.5);
        assert!(r.alt_tail.is_none());
    }

    #[test]
    fn test_alternative_tail_is_larger() {
        let m = model();
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 22);
        let observed = Dataset::counts(vec![7.0]).unwrap();
        let null = m.point(vec![0.0]).unwrap();
        let alt = m.point(vec![5.0]).unwrap();
        let r = ToyHypotest::new(&m, &NumEvents, &toys)
            .with_alternative(&alt, 2000)
            .run(&null, &observed, 2000)
            .unwrap();
        assert!(r.alt_tail.unwrap() > r.p_value);
        assert_eq!(r.alt_counts.unwrap().n_requested, 2000);
    }

    #[test]
    fn test_cancelled_run_has_no_toys() {
        let m = model();
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let observed = Dataset::counts(vec![2.0]).unwrap();
        let err = ToyHypotest::new(&m, &NumEvents, &toys)
            .with_cancellation(&cancel)
            .run(&m.point(vec![0.0]).unwrap(), &observed, 10)
            .unwrap_err();
        assert!(matches!(err, Error::Computation(_)));
    }
}
