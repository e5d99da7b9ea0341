//! Expected limit bands from background-only toys.
//!
//! Each toy is scanned over the belt's POI grid and inverted against the
//! already built belt; the band is read off the distribution of per-toy limits.

use crate::belt::ConfidenceBelt;
use crate::interval::{IntervalInverter, IntervalKind, LimitStatus, ObservedScan};
use crate::sampling::quantile_sorted;
use crate::test_statistic::TestStatistic;
use crate::toys::ToyGenerator;
use nc_core::{CancellationToken, Dataset, Error, ParameterPoint, ParametricModel, Result};
use nc_prob::normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Band positions in units of σ, ascending.
pub const BAND_SIGMAS: [f64; 5] = [-2.0, -1.0, 0.0, 1.0, 2.0];

/// Stream id reserved for band toys (no finite POI maps to it).
const BAND_STREAM: u64 = u64::MAX;

/// Background-only toy tail fractions at the observed limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClbValues {
    /// POI value the toys were evaluated at (the observed limit).
    pub poi: f64,
    /// Observed statistic at `poi`.
    pub t_observed: f64,
    /// `P(t_toy > t_obs)`.
    pub strict: f64,
    /// `P(t_toy >= t_obs)`.
    pub inclusive: f64,
}

/// Quantiles of the per-toy limit distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedBand {
    /// −2σ quantile.
    pub minus_two: f64,
    /// −1σ quantile.
    pub minus_one: f64,
    /// Median.
    pub median: f64,
    /// +1σ quantile.
    pub plus_one: f64,
    /// +2σ quantile.
    pub plus_two: f64,
    /// Per-toy limits, ascending.
    pub limits: Vec<f64>,
    /// Toys asked for.
    pub n_requested: usize,
    /// Toys without a usable limit (model errors, undefined inversions).
    pub n_failed: usize,
    /// Toy limits open at the scan edge (included in `limits`).
    pub n_open: usize,
    /// Toys not run because of cancellation.
    pub n_skipped: usize,
    /// Cancellation stopped the ensemble early or the belt was partial.
    pub partial: bool,
    /// Tail fractions at the observed limit, if requested.
    pub clb: Option<ClbValues>,
}

impl ExpectedBand {
    /// The five quantiles in [`BAND_SIGMAS`] order.
    pub fn quantiles(&self) -> [f64; 5] {
        [self.minus_two, self.minus_one, self.median, self.plus_one, self.plus_two]
    }

    /// Where `limit` falls in the toy distribution, in σ.
    pub fn observed_sigma(&self, limit: f64) -> f64 {
        let n = self.limits.len();
        if n == 0 || !limit.is_finite() {
            return f64::NAN;
        }
        let below = self.limits.partition_point(|v| *v < limit);
        let frac = ((below as f64 + 0.5) / (n as f64 + 1.0)).clamp(1e-12, 1.0 - 1e-12);
        normal::quantile(frac).unwrap_or(f64::NAN)
    }
}

enum ToyLimit {
    Limit { value: f64, open: bool },
    Failed,
    Skipped,
}

/// One band toy: its limit and, when CLb is requested, its statistic at the observed limit.
struct BandToy {
    limit: ToyLimit,
    clb_t: Option<f64>,
}

impl BandToy {
    fn without_data(limit: ToyLimit) -> Self {
        Self { limit, clb_t: None }
    }
}

/// Builds an [`ExpectedBand`] against a fixed belt.
pub struct ExpectedBandBuilder<'a> {
    model: &'a dyn ParametricModel,
    test_stat: &'a dyn TestStatistic,
    belt: &'a ConfidenceBelt,
    inverter: IntervalInverter,
    toys: &'a ToyGenerator,
    cancel: Option<&'a CancellationToken>,
    clb_at: Option<(f64, f64)>,
}

impl<'a> ExpectedBandBuilder<'a> {
    /// Builder inverting toys against `belt` with `inverter`.
    pub fn new(
        model: &'a dyn ParametricModel,
        test_stat: &'a dyn TestStatistic,
        belt: &'a ConfidenceBelt,
        inverter: IntervalInverter,
        toys: &'a ToyGenerator,
    ) -> Self {
        Self { model, test_stat, belt, inverter, toys, cancel: None, clb_at: None }
    }

    /// Stop dispatching toys once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Also compute CLb at the observed limit `poi` with observed statistic `t_observed`.
    pub fn with_clb(mut self, poi: f64, t_observed: f64) -> Self {
        self.clb_at = Some((poi, t_observed));
        self
    }

    /// Run `n_toy_mc` toys generated at `reference`.
    pub fn build(&self, reference: &ParameterPoint, n_toy_mc: usize) -> Result<ExpectedBand> {
        if n_toy_mc == 0 {
            return Err(Error::Validation("n_toy_mc must be > 0".into()));
        }
        if self.belt.is_empty() {
            return Err(Error::Computation("expected bands need a non-empty belt".into()));
        }
        let stream = self.toys.stream(BAND_STREAM);
        let grid = self.belt.poi_values();

        let outcomes: Vec<Result<BandToy>> = (0..n_toy_mc)
            .into_par_iter()
            .with_min_len(4)
            .map(|i| self.run_toy(&stream, reference, &grid, i as u64))
            .collect();

        let mut limits = Vec::with_capacity(n_toy_mc);
        let mut clb_ts = Vec::new();
        let (mut n_failed, mut n_open, mut n_skipped) = (0usize, 0usize, 0usize);
        for outcome in outcomes {
            let toy = outcome?;
            clb_ts.extend(toy.clb_t);
            match toy.limit {
                ToyLimit::Limit { value, open } => {
                    limits.push(value);
                    n_open += usize::from(open);
                }
                ToyLimit::Failed => n_failed += 1,
                ToyLimit::Skipped => n_skipped += 1,
            }
        }
        limits.sort_by(f64::total_cmp);

        let q: Vec<f64> = BAND_SIGMAS
            .iter()
            .map(|&s| quantile_sorted(&limits, normal::cdf(s)))
            .collect();

        // Every toy with a finite statistic counts, whether or not its limit is defined.
        let clb = match self.clb_at {
            Some(_) if clb_ts.is_empty() => {
                log::warn!("no band toy produced a statistic at the observed limit; CLb skipped");
                None
            }
            Some((poi, t_observed)) => {
                let n = clb_ts.len() as f64;
                let strict = clb_ts.iter().filter(|t| **t > t_observed).count() as f64 / n;
                let inclusive = clb_ts.iter().filter(|t| **t >= t_observed).count() as f64 / n;
                Some(ClbValues { poi, t_observed, strict, inclusive })
            }
            None => None,
        };

        if n_open > 0 {
            log::warn!("{n_open} of {n_toy_mc} toy limits are open at the scan edge");
        }
        log::info!(
            "expected band from {} toys: median {:.4} [{:.4}, {:.4}], {} failed",
            limits.len(),
            q[2],
            q[1],
            q[3],
            n_failed
        );

        Ok(ExpectedBand {
            minus_two: q[0],
            minus_one: q[1],
            median: q[2],
            plus_one: q[3],
            plus_two: q[4],
            limits,
            n_requested: n_toy_mc,
            n_failed,
            n_open,
            n_skipped,
            partial: n_skipped > 0 || self.belt.is_partial(),
            clb,
        })
    }

    fn run_toy(
        &self,
        stream: &ToyGenerator,
        reference: &ParameterPoint,
        grid: &[f64],
        index: u64,
    ) -> Result<BandToy> {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            return Ok(BandToy::without_data(ToyLimit::Skipped));
        }
        let data = match stream.generate(self.model, reference, index) {
            Ok(d) => d,
            Err(e) if e.is_recoverable() => return Ok(BandToy::without_data(ToyLimit::Failed)),
            Err(e) => return Err(e),
        };
        let clb_t = match self.clb_at {
            Some((poi, _)) => match self.test_stat.evaluate(self.model, &data, poi) {
                Ok(v) if v.value.is_finite() => Some(v.value),
                Ok(_) => None,
                Err(e) if e.is_recoverable() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        let limit = self.toy_limit(&data, grid)?;
        Ok(BandToy { limit, clb_t })
    }

    fn toy_limit(&self, data: &Dataset, grid: &[f64]) -> Result<ToyLimit> {
        let scan = match self.scan(data, grid) {
            Ok(s) => s,
            Err(e) if e.is_recoverable() => return Ok(ToyLimit::Failed),
            Err(e) => return Err(e),
        };
        let ci = self.inverter.invert(self.belt, &scan)?;
        let limit = match self.inverter.kind {
            IntervalKind::LowerLimit => ci.lower,
            IntervalKind::UpperLimit | IntervalKind::TwoSided => ci.upper,
        };
        if limit.status == LimitStatus::Undefined || !limit.value.is_finite() {
            return Ok(ToyLimit::Failed);
        }
        Ok(ToyLimit::Limit { value: limit.value, open: limit.status == LimitStatus::OpenAtScanEdge })
    }

    fn scan(&self, data: &Dataset, grid: &[f64]) -> Result<ObservedScan> {
        if !self.test_stat.depends_on_poi() {
            let v = self.test_stat.evaluate(self.model, data, grid[0])?;
            return Ok(ObservedScan::constant(grid, v.value));
        }
        let values = self.test_stat.evaluate_scan(self.model, data, grid)?;
        Ok(ObservedScan {
            converged: values.iter().all(|v| v.converged),
            points: values.into_iter().map(|v| (v.poi_value, v.value)).collect(),
            n_failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MaximumLikelihoodEstimator;
    use crate::belt::{BeltConfig, BeltPoint, ConfidenceBeltBuilder, NuisancePolicy};
    use crate::interval::Interpolation;
    use crate::sampling::AcceptanceSide;
    use crate::test_statistic::{NumEvents, PlrPolicy, ProfileLikelihoodRatio};
    use nc_core::{CountPolicy, ParameterSpec};
    use nc_model::PoissonCountModel;

    fn model() -> PoissonCountModel {
        PoissonCountModel::new(3.0, ParameterSpec::new("mu", 0.0, 0.0, 15.0).unwrap()).unwrap()
    }

    fn grid() -> Vec<f64> {
        (0..=20).map(|i| 0.5 * i as f64).collect()
    }

    fn cfg(n_toys: usize) -> BeltConfig {
        BeltConfig {
            confidence_level: 0.9,
            side: AcceptanceSide::Upper,
            nuisance_policy: NuisancePolicy::Nominal,
            n_toys,
            ..BeltConfig::default()
        }
    }

    #[test]
    fn test_band_is_ordered() {
        let m = model();
        let mle = MaximumLikelihoodEstimator::new();
        let stat = ProfileLikelihoodRatio::new(mle.clone(), PlrPolicy::OneSided);
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 17);
        let belt = ConfidenceBeltBuilder::new(&m, &stat, &mle, &toys)
            .with_config(cfg(200))
            .build(&grid(), None)
            .unwrap();
        let inv = IntervalInverter::new(IntervalKind::UpperLimit, Interpolation::Linear);
        let band = ExpectedBandBuilder::new(&m, &stat, &belt, inv, &toys)
            .build(&m.point(vec![0.0]).unwrap(), 60)
            .unwrap();
        let q = band.quantiles();
        for w in q.windows(2) {
            assert!(w[0] <= w[1], "{q:?}");
        }
        assert_eq!(band.limits.len() + band.n_failed, 60);
        assert!(band.median > 0.0 && band.median < 10.0, "{}", band.median);
        assert!(!band.partial);
        assert!(band.clb.is_none());
    }

    #[test]
    fn test_clb_fractions() {
        let m = model();
        let mle = MaximumLikelihoodEstimator::new();
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 4);
        let belt = ConfidenceBeltBuilder::new(&m, &NumEvents, &mle, &toys)
            .with_config(cfg(200))
            .build(&grid(), None)
            .unwrap();
        let inv = IntervalInverter::default();
        let band = ExpectedBandBuilder::new(&m, &NumEvents, &belt, inv, &toys)
            .with_clb(4.0, 3.0)
            .build(&m.point(vec![0.0]).unwrap(), 100)
            .unwrap();
        let clb = band.clb.unwrap();
        // background-only counts: P(n > 3) < P(n >= 3)
        assert!(clb.strict < clb.inclusive);
        assert!((0.0..=1.0).contains(&clb.strict));
    }

    #[test]
    fn test_band_cancellation_is_partial() {
        let m = model();
        let mle = MaximumLikelihoodEstimator::new();
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 4);
        let belt = ConfidenceBeltBuilder::new(&m, &NumEvents, &mle, &toys)
            .with_config(cfg(50))
            .build(&grid(), None)
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let band = ExpectedBandBuilder::new(&m, &NumEvents, &belt, IntervalInverter::default(), &toys)
            .with_cancellation(&cancel)
            .build(&m.point(vec![0.0]).unwrap(), 10)
            .unwrap();
        assert!(band.partial);
        assert_eq!(band.n_skipped, 10);
        assert!(band.median.is_nan());
    }

    #[test]
    fn test_clb_without_usable_toys_is_none() {
        let m = model();
        let mle = MaximumLikelihoodEstimator::new();
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 4);
        let belt = ConfidenceBeltBuilder::new(&m, &NumEvents, &mle, &toys)
            .with_config(cfg(50))
            .build(&grid(), None)
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let band = ExpectedBandBuilder::new(&m, &NumEvents, &belt, IntervalInverter::default(), &toys)
            .with_cancellation(&cancel)
            .with_clb(2.0, 3.0)
            .build(&m.point(vec![0.0]).unwrap(), 10)
            .unwrap();
        assert!(band.clb.is_none());
    }

    #[test]
    fn test_clb_counts_toys_with_undefined_limits() {
        // Counts above 3 are rejected at every POI, so those toys have no limit.
        let m = model();
        let points = grid()
            .into_iter()
            .map(|poi| BeltPoint {
                poi,
                generation_point: m.point(vec![poi]).unwrap(),
                lower: f64::NEG_INFINITY,
                upper: 3.0,
                counts: crate::sampling::ToyCounts::default(),
                low_confidence: false,
                unreliable: false,
            })
            .collect();
        let belt = ConfidenceBelt::from_points(
            0.9,
            AcceptanceSide::Upper,
            NuisancePolicy::Nominal,
            "num_events",
            points,
        );
        let toys = ToyGenerator::new(CountPolicy::NumberCounting, 8);
        let reference = m.point(vec![0.0]).unwrap();
        let n = 400;
        let inv = IntervalInverter::new(IntervalKind::TwoSided, Interpolation::Linear);
        let band = ExpectedBandBuilder::new(&m, &NumEvents, &belt, inv, &toys)
            .with_clb(1.0, 3.0)
            .build(&reference, n)
            .unwrap();
        assert!(band.n_failed > 0);
        assert_eq!(band.limits.len() + band.n_failed, n);

        let stream = toys.stream(BAND_STREAM);
        let at_least_three = (0..n as u64)
            .filter(|&i| stream.generate(&m, &reference, i).unwrap().entry(0)[0] >= 3.0)
            .count();
        let clb = band.clb.unwrap();
        assert_eq!(clb.inclusive, at_least_three as f64 / n as f64);
        // P(n >= 3 | 3) = 0.577 over all toys; the defined-limit subset alone gives ~0.35
        assert!((clb.inclusive - 0.577).abs() < 0.1, "{}", clb.inclusive);
    }

    #[test]
    fn test_observed_sigma_is_centered() {
        let band = ExpectedBand {
            minus_two: 0.0,
            minus_one: 0.0,
            median: 0.0,
            plus_one: 0.0,
            plus_two: 0.0,
            limits: (0..101).map(|i| i as f64).collect(),
            n_requested: 101,
            n_failed: 0,
            n_open: 0,
            n_skipped: 0,
            partial: false,
            clb: None,
        };
        assert!(band.observed_sigma(50.0).abs() < 0.05);
        assert!(band.observed_sigma(90.0) > 1.0);
        assert!(band.observed_sigma(f64::NAN).is_nan());
    }
}
