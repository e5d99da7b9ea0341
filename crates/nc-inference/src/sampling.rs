//! Sampling distributions of a test statistic from toy ensembles.
//!
//! Toys are independent: each one is generated from its own seeded RNG and
//! evaluated on a rayon worker. Results are collected in toy order, so a seeded
//! ensemble is bit-for-bit reproducible regardless of the thread count.

use crate::test_statistic::TestStatistic;
use crate::toys::ToyGenerator;
use nc_core::{CancellationToken, Error, ParameterPoint, ParametricModel, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Which side(s) of the sampling distribution make up the acceptance region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceSide {
    /// Accept `t <= upper` (likelihood-ratio ordering).
    #[default]
    Upper,
    /// Accept `t >= lower`.
    Lower,
    /// Accept `lower <= t <= upper`, splitting `1 - CL` evenly.
    Central,
}

/// One toy's statistic value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToySample {
    /// Statistic value.
    pub value: f64,
    /// Index of the toy inside its generator stream.
    pub toy_index: u64,
    /// All fits converged.
    pub converged: bool,
}

/// Per-ensemble bookkeeping of what happened to each requested toy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToyCounts {
    /// Toys asked for.
    pub n_requested: usize,
    /// Toys contributing a sample.
    pub n_valid: usize,
    /// Toys whose generation or likelihood evaluation failed.
    pub n_model_errors: usize,
    /// Toys whose fit aborted (line search failure, time budget).
    pub n_fit_failures: usize,
    /// Toys whose statistic came out NaN or infinite.
    pub n_nonfinite: usize,
    /// Toys whose fit finished without meeting the convergence criteria.
    pub n_nonconverged: usize,
    /// Toys not started because of cancellation.
    pub n_skipped: usize,
}

impl ToyCounts {
    /// Add another ensemble's counts.
    pub fn merge(&mut self, other: &ToyCounts) {
        self.n_requested += other.n_requested;
        self.n_valid += other.n_valid;
        self.n_model_errors += other.n_model_errors;
        self.n_fit_failures += other.n_fit_failures;
        self.n_nonfinite += other.n_nonfinite;
        self.n_nonconverged += other.n_nonconverged;
        self.n_skipped += other.n_skipped;
    }

    /// Toys lost to errors (excluding cancellation).
    pub fn n_failed(&self) -> usize {
        self.n_model_errors + self.n_fit_failures + self.n_nonfinite
    }
}

/// Empirical distribution of a test statistic at one generation point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingDistribution {
    generation_point: ParameterPoint,
    tested_poi: f64,
    samples: Vec<ToySample>,
    sorted: Vec<f64>,
    counts: ToyCounts,
    next_index: u64,
    cancelled: bool,
}

/// Index `k` (1-based count) of the smallest order statistic covering fraction `p`.
fn covering_count(p: f64, n: usize) -> usize {
    (((p * n as f64) - 1e-9).ceil().max(1.0) as usize).min(n)
}

/// Linear-interpolation quantile of ascending `sorted`.
pub(crate) fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[n - 1];
    }
    let idx = p * ((n - 1) as f64);
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let w = idx - (lo as f64);
    sorted[lo] + w * (sorted[hi] - sorted[lo])
}

impl SamplingDistribution {
    fn empty(generation_point: ParameterPoint, tested_poi: f64) -> Self {
        Self {
            generation_point,
            tested_poi,
            samples: Vec::new(),
            sorted: Vec::new(),
            counts: ToyCounts::default(),
            next_index: 0,
            cancelled: false,
        }
    }

    /// Distribution from precomputed values (all treated as converged).
    pub fn from_values(generation_point: ParameterPoint, tested_poi: f64, values: &[f64]) -> Self {
        let mut d = Self::empty(generation_point, tested_poi);
        for (i, &v) in values.iter().enumerate() {
            if v.is_finite() {
                d.samples.push(ToySample { value: v, toy_index: i as u64, converged: true });
            } else {
                d.counts.n_nonfinite += 1;
            }
        }
        d.counts.n_requested = values.len();
        d.next_index = values.len() as u64;
        d.refresh();
        d
    }

    fn refresh(&mut self) {
        self.sorted = self.samples.iter().map(|s| s.value).collect();
        self.sorted.sort_by(f64::total_cmp);
        self.counts.n_valid = self.samples.len();
    }

    /// Point the toys were generated at.
    pub fn generation_point(&self) -> &ParameterPoint {
        &self.generation_point
    }

    /// POI value the statistic was evaluated at.
    pub fn tested_poi(&self) -> f64 {
        self.tested_poi
    }

    /// Samples in toy order.
    pub fn samples(&self) -> &[ToySample] {
        &self.samples
    }

    /// Sample values, ascending.
    pub fn sorted_values(&self) -> &[f64] {
        &self.sorted
    }

    /// Bookkeeping counts.
    pub fn counts(&self) -> &ToyCounts {
        &self.counts
    }

    /// Number of usable samples.
    pub fn n_valid(&self) -> usize {
        self.samples.len()
    }

    /// Cancellation stopped the ensemble early.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Every requested toy produced a sample.
    pub fn is_complete(&self) -> bool {
        self.counts.n_valid == self.counts.n_requested
    }

    /// Fraction of attempted toys whose fit did not converge.
    pub fn nonconverged_fraction(&self) -> f64 {
        let attempted = self.counts.n_requested - self.counts.n_skipped;
        if attempted == 0 {
            return 0.0;
        }
        (self.counts.n_nonconverged + self.counts.n_fit_failures) as f64 / attempted as f64
    }

    /// Non-convergence stays at or below `max_fraction`.
    pub fn is_reliable(&self, max_fraction: f64) -> bool {
        self.nonconverged_fraction() <= max_fraction
    }

    /// Smallest sample `t` with at least a fraction `p` of samples `<= t`.
    pub fn upper_acceptance(&self, p: f64) -> Option<f64> {
        let n = self.sorted.len();
        if n == 0 {
            return None;
        }
        Some(self.sorted[covering_count(p, n) - 1])
    }

    /// Largest sample `t` with at least a fraction `p` of samples `>= t`.
    pub fn lower_acceptance(&self, p: f64) -> Option<f64> {
        let n = self.sorted.len();
        if n == 0 {
            return None;
        }
        Some(self.sorted[n - covering_count(p, n)])
    }

    /// `(lower, upper)` acceptance thresholds at confidence level `cl`.
    pub fn acceptance(&self, cl: f64, side: AcceptanceSide) -> Option<(f64, f64)> {
        match side {
            AcceptanceSide::Upper => Some((f64::NEG_INFINITY, self.upper_acceptance(cl)?)),
            AcceptanceSide::Lower => Some((self.lower_acceptance(cl)?, f64::INFINITY)),
            AcceptanceSide::Central => {
                let p = 0.5 * (1.0 + cl);
                Some((self.lower_acceptance(p)?, self.upper_acceptance(p)?))
            }
        }
    }

    /// Samples strictly outside the acceptance region.
    pub fn count_outside(&self, lower: f64, upper: f64) -> usize {
        let below = self.sorted.partition_point(|v| *v < lower);
        let above = self.sorted.len() - self.sorted.partition_point(|v| *v <= upper);
        below + above
    }

    /// Interpolated quantile.
    pub fn quantile(&self, p: f64) -> f64 {
        quantile_sorted(&self.sorted, p)
    }

    /// Fraction of samples `>= t` (`inclusive`) or `> t`.
    pub fn tail_probability(&self, t: f64, inclusive: bool) -> f64 {
        let n = self.sorted.len();
        if n == 0 {
            return f64::NAN;
        }
        let idx = if inclusive {
            self.sorted.partition_point(|v| *v < t)
        } else {
            self.sorted.partition_point(|v| *v <= t)
        };
        (n - idx) as f64 / n as f64
    }

    /// Fraction of samples `<= t` (`inclusive`) or `< t`.
    pub fn lower_tail_probability(&self, t: f64, inclusive: bool) -> f64 {
        let n = self.sorted.len();
        if n == 0 {
            return f64::NAN;
        }
        let idx = if inclusive {
            self.sorted.partition_point(|v| *v <= t)
        } else {
            self.sorted.partition_point(|v| *v < t)
        };
        idx as f64 / n as f64
    }
}

/// Outcome of one toy.
enum ToyOutcome {
    Sample(ToySample),
    ModelError,
    FitFailure,
    NonFinite,
    Skipped,
    Fatal(Error),
}

/// Stopping rule for adaptive ensembles: keep adding batches until at least
/// `toys_in_tail` samples lie outside the acceptance region or `max_toys` is hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TailTarget {
    /// Confidence level defining the acceptance region.
    pub confidence_level: f64,
    /// Acceptance side.
    pub side: AcceptanceSide,
    /// Required samples outside the acceptance region.
    pub toys_in_tail: usize,
    /// Hard cap on toys.
    pub max_toys: usize,
}

/// Builds [`SamplingDistribution`]s by running toys in parallel.
pub struct SamplingDistributionBuilder<'a> {
    model: &'a dyn ParametricModel,
    test_stat: &'a dyn TestStatistic,
    toys: &'a ToyGenerator,
    cancel: Option<&'a CancellationToken>,
    keep_nonconverged: bool,
}

impl<'a> SamplingDistributionBuilder<'a> {
    /// Builder over `model`, `test_stat`, and the toy stream `toys`.
    pub fn new(
        model: &'a dyn ParametricModel,
        test_stat: &'a dyn TestStatistic,
        toys: &'a ToyGenerator,
    ) -> Self {
        Self { model, test_stat, toys, cancel: None, keep_nonconverged: true }
    }

    /// Stop dispatching toys once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Keep (flagged) samples from fits that did not converge. Default: `true`.
    pub fn keep_nonconverged(mut self, keep: bool) -> Self {
        self.keep_nonconverged = keep;
        self
    }

    /// `n_toys` toys at `point`, evaluated at the point's own POI value.
    pub fn build(&self, point: &ParameterPoint, n_toys: usize) -> Result<SamplingDistribution> {
        self.build_evaluated_at(point, point.poi_value(), n_toys)
    }

    /// `n_toys` toys at `point`, evaluated at `tested_poi`.
    pub fn build_evaluated_at(
        &self,
        point: &ParameterPoint,
        tested_poi: f64,
        n_toys: usize,
    ) -> Result<SamplingDistribution> {
        let mut dist = SamplingDistribution::empty(point.clone(), tested_poi);
        self.extend(&mut dist, n_toys)?;
        Ok(dist)
    }

    /// Start with `n_toys` and grow in batches of `n_toys` until `target` is met.
    pub fn build_adaptive(
        &self,
        point: &ParameterPoint,
        n_toys: usize,
        target: TailTarget,
    ) -> Result<SamplingDistribution> {
        let mut dist = self.build(point, n_toys)?;
        while !dist.cancelled() && dist.counts().n_requested < target.max_toys {
            let Some((lo, hi)) = dist.acceptance(target.confidence_level, target.side) else {
                break;
            };
            if dist.count_outside(lo, hi) >= target.toys_in_tail {
                break;
            }
            let batch = n_toys.min(target.max_toys - dist.counts().n_requested);
            if batch == 0 {
                break;
            }
            self.extend(&mut dist, batch)?;
        }
        Ok(dist)
    }

    /// Append `n_more` toys, continuing the toy index sequence.
    pub fn extend(&self, dist: &mut SamplingDistribution, n_more: usize) -> Result<()> {
        let start = dist.next_index;
        let point = dist.generation_point.clone();
        let tested = dist.tested_poi;

        let outcomes: Vec<ToyOutcome> = (0..n_more)
            .into_par_iter()
            .with_min_len(8)
            .map(|k| self.run_toy(&point, tested, start + k as u64))
            .collect();

        let mut counts = ToyCounts { n_requested: n_more, ..ToyCounts::default() };
        for outcome in outcomes {
            match outcome {
                ToyOutcome::Sample(s) => {
                    if !s.converged {
                        counts.n_nonconverged += 1;
                        if !self.keep_nonconverged {
                            continue;
                        }
                    }
                    dist.samples.push(s);
                }
                ToyOutcome::ModelError => counts.n_model_errors += 1,
                ToyOutcome::FitFailure => counts.n_fit_failures += 1,
                ToyOutcome::NonFinite => counts.n_nonfinite += 1,
                ToyOutcome::Skipped => {
                    counts.n_skipped += 1;
                    dist.cancelled = true;
                }
                ToyOutcome::Fatal(e) => return Err(e),
            }
        }
        dist.counts.merge(&counts);
        dist.next_index = start + n_more as u64;
        dist.refresh();

        log::debug!(
            "sampling distribution at {} = {}: {}/{} valid, {} failed, {} non-converged",
            point.names()[point.poi_index()],
            point.poi_value(),
            dist.counts.n_valid,
            dist.counts.n_requested,
            dist.counts.n_failed(),
            dist.counts.n_nonconverged
        );
        Ok(())
    }

    fn run_toy(&self, point: &ParameterPoint, tested_poi: f64, index: u64) -> ToyOutcome {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            return ToyOutcome::Skipped;
        }
        let data = match self.toys.generate(self.model, point, index) {
            Ok(d) => d,
            Err(e) if e.is_recoverable() => return ToyOutcome::ModelError,
            Err(e) => return ToyOutcome::Fatal(e),
        };
        match self.test_stat.evaluate(self.model, &data, tested_poi) {
            Ok(v) if !v.value.is_finite() => ToyOutcome::NonFinite,
            Ok(v) => ToyOutcome::Sample(ToySample {
                value: v.value,
                toy_index: index,
                converged: v.converged,
            }),
            Err(Error::NonConvergence(_)) => ToyOutcome::FitFailure,
            Err(e) if e.is_recoverable() => ToyOutcome::ModelError,
            Err(e) => ToyOutcome::Fatal(e),
        }
    }
}
