//! Confidence belt construction.
//!
//! For every scanned POI value a sampling distribution of the test statistic is
//! built at a generation point with that POI value, and the acceptance thresholds
//! for the configured confidence level are read off it.
//!
//! Near a hard POI boundary (e.g. `mu >= 0`) toys pile up against the boundary
//! and the thresholds there come out larger than elsewhere. They are recorded as
//! they are; nothing is clipped.

use crate::mle::MaximumLikelihoodEstimator;
use crate::sampling::{AcceptanceSide, SamplingDistributionBuilder, TailTarget, ToyCounts};
use crate::test_statistic::TestStatistic;
use crate::toys::ToyGenerator;
use nc_core::{CancellationToken, Dataset, Error, ParameterPoint, ParametricModel, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Where the nuisance parameters of each generation point come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NuisancePolicy {
    /// Conditional MLE on the observed data at the scanned POI value.
    #[default]
    Profiled,
    /// The model's nominal values.
    Nominal,
}

/// Acceptance region at one scanned POI value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeltPoint {
    /// Scanned POI value.
    pub poi: f64,
    /// Point the toys were generated at.
    pub generation_point: ParameterPoint,
    /// Lower threshold (`-inf` for upper-side acceptance).
    pub lower: f64,
    /// Upper threshold (`+inf` for lower-side acceptance).
    pub upper: f64,
    /// Toy bookkeeping for this point.
    pub counts: ToyCounts,
    /// Fewer valid toys than requested.
    pub low_confidence: bool,
    /// Non-convergence above the configured fraction.
    pub unreliable: bool,
}

impl BeltPoint {
    /// `lower <= t <= upper`.
    pub fn accepts(&self, t: f64) -> bool {
        t >= self.lower && t <= self.upper
    }

    /// Signed distance to the nearest threshold: `>= 0` inside, `< 0` outside.
    pub fn margin(&self, t: f64) -> f64 {
        (self.upper - t).min(t - self.lower)
    }
}

/// Acceptance regions over an ordered POI grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceBelt {
    confidence_level: f64,
    side: AcceptanceSide,
    nuisance_policy: NuisancePolicy,
    statistic: String,
    points: Vec<BeltPoint>,
    partial: bool,
    n_failed_points: usize,
}

impl ConfidenceBelt {
    /// Belt from already computed points; points are sorted by POI.
    pub fn from_points(
        confidence_level: f64,
        side: AcceptanceSide,
        nuisance_policy: NuisancePolicy,
        statistic: impl Into<String>,
        mut points: Vec<BeltPoint>,
    ) -> Self {
        points.sort_by(|a, b| a.poi.total_cmp(&b.poi));
        points.dedup_by(|a, b| a.poi == b.poi);
        Self {
            confidence_level,
            side,
            nuisance_policy,
            statistic: statistic.into(),
            points,
            partial: false,
            n_failed_points: 0,
        }
    }

    /// Confidence level.
    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// Acceptance side.
    pub fn side(&self) -> AcceptanceSide {
        self.side
    }

    /// Nuisance policy used for the generation points.
    pub fn nuisance_policy(&self) -> NuisancePolicy {
        self.nuisance_policy
    }

    /// Name of the test statistic the belt was built for.
    pub fn statistic(&self) -> &str {
        &self.statistic
    }

    /// Points in ascending POI order.
    pub fn points(&self) -> &[BeltPoint] {
        &self.points
    }

    /// Scanned POI values, ascending.
    pub fn poi_values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.poi).collect()
    }

    /// Point at exactly `poi`, if scanned.
    pub fn point_at(&self, poi: f64) -> Option<&BeltPoint> {
        self.points
            .binary_search_by(|p| p.poi.total_cmp(&poi))
            .ok()
            .map(|i| &self.points[i])
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// No points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Construction stopped early (cancellation).
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Scan points dropped for lack of valid toys.
    pub fn n_failed_points(&self) -> usize {
        self.n_failed_points
    }

    /// Aggregate toy counts over all points.
    pub fn toy_counts(&self) -> ToyCounts {
        let mut total = ToyCounts::default();
        for p in &self.points {
            total.merge(&p.counts);
        }
        total
    }

    /// Points flagged low-confidence.
    pub fn n_low_confidence(&self) -> usize {
        self.points.iter().filter(|p| p.low_confidence).count()
    }

    /// Points flagged unreliable.
    pub fn n_unreliable(&self) -> usize {
        self.points.iter().filter(|p| p.unreliable).count()
    }

    /// Fold in points from a refinement belt. Existing POI values win.
    pub fn merge(&mut self, other: ConfidenceBelt) -> Result<()> {
        if other.confidence_level != self.confidence_level
            || other.side != self.side
            || other.statistic != self.statistic
        {
            return Err(Error::Validation(format!(
                "cannot merge belts: ({}, {:?}, {}) vs ({}, {:?}, {})",
                self.confidence_level,
                self.side,
                self.statistic,
                other.confidence_level,
                other.side,
                other.statistic
            )));
        }
        self.partial |= other.partial;
        self.n_failed_points += other.n_failed_points;
        for p in other.points {
            if let Err(i) = self.points.binary_search_by(|q| q.poi.total_cmp(&p.poi)) {
                self.points.insert(i, p);
            }
        }
        Ok(())
    }
}

/// Belt construction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeltConfig {
    /// Confidence level in `(0, 1)`.
    pub confidence_level: f64,
    /// Acceptance side.
    pub side: AcceptanceSide,
    /// Nuisance policy.
    pub nuisance_policy: NuisancePolicy,
    /// Toys per scan point.
    pub n_toys: usize,
    /// Keep adding toys until this many fall outside the acceptance region.
    pub toys_in_tail: Option<usize>,
    /// Cap on toys per point in adaptive mode.
    pub max_toys: usize,
    /// Keep samples from non-converged fits (flagged).
    pub keep_nonconverged: bool,
    /// Non-convergence fraction above which a point is unreliable.
    pub max_nonconverged_fraction: f64,
}

impl Default for BeltConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            side: AcceptanceSide::Upper,
            nuisance_policy: NuisancePolicy::Profiled,
            n_toys: 1000,
            toys_in_tail: None,
            max_toys: 20_000,
            keep_nonconverged: true,
            max_nonconverged_fraction: 0.1,
        }
    }
}

impl BeltConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(Error::Validation(format!(
                "confidence level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.n_toys == 0 {
            return Err(Error::Validation("n_toys must be > 0".into()));
        }
        if self.toys_in_tail.is_some() && self.max_toys < self.n_toys {
            return Err(Error::Validation(format!(
                "max_toys ({}) < n_toys ({})",
                self.max_toys, self.n_toys
            )));
        }
        if !(0.0..=1.0).contains(&self.max_nonconverged_fraction) {
            return Err(Error::Validation(format!(
                "max_nonconverged_fraction must be in [0, 1], got {}",
                self.max_nonconverged_fraction
            )));
        }
        Ok(())
    }
}

/// Check that `grid` is non-empty, finite, strictly increasing, and inside `bounds`.
pub fn validate_grid(grid: &[f64], bounds: (f64, f64)) -> Result<()> {
    if grid.is_empty() {
        return Err(Error::Validation("empty POI scan grid".into()));
    }
    for &v in grid {
        if !v.is_finite() || v < bounds.0 || v > bounds.1 {
            return Err(Error::Validation(format!(
                "scan value {v} outside POI range [{}, {}]",
                bounds.0, bounds.1
            )));
        }
    }
    if grid.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Validation("scan grid must be strictly increasing".into()));
    }
    Ok(())
}

enum PointOutcome {
    Done(BeltPoint),
    Failed,
    Skipped,
}

/// Builds a [`ConfidenceBelt`] over a POI grid.
pub struct ConfidenceBeltBuilder<'a> {
    model: &'a dyn ParametricModel,
    test_stat: &'a dyn TestStatistic,
    mle: &'a MaximumLikelihoodEstimator,
    toys: &'a ToyGenerator,
    config: BeltConfig,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> ConfidenceBeltBuilder<'a> {
    /// Builder with default [`BeltConfig`].
    pub fn new(
        model: &'a dyn ParametricModel,
        test_stat: &'a dyn TestStatistic,
        mle: &'a MaximumLikelihoodEstimator,
        toys: &'a ToyGenerator,
    ) -> Self {
        Self { model, test_stat, mle, toys, config: BeltConfig::default(), cancel: None }
    }

    /// Replace the settings.
    pub fn with_config(mut self, config: BeltConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop dispatching once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &BeltConfig {
        &self.config
    }

    /// Build the belt over `grid`. `observed` is required for profiled nuisances.
    pub fn build(&self, grid: &[f64], observed: Option<&Dataset>) -> Result<ConfidenceBelt> {
        self.config.validate()?;
        validate_grid(grid, self.model.poi_bounds())?;
        self.toys.validate_for(self.model)?;

        let generation_points = self.generation_points(grid, observed)?;

        let outcomes: Vec<Result<PointOutcome>> = grid
            .par_iter()
            .zip(generation_points.into_par_iter())
            .map(|(&poi, point)| match point {
                Some(point) => self.build_point(poi, point),
                None => Ok(PointOutcome::Failed),
            })
            .collect();

        let mut points = Vec::with_capacity(grid.len());
        let mut n_failed = 0usize;
        let mut partial = false;
        for outcome in outcomes {
            match outcome? {
                PointOutcome::Done(p) => {
                    partial |= p.counts.n_skipped > 0;
                    points.push(p);
                }
                PointOutcome::Failed => n_failed += 1,
                PointOutcome::Skipped => partial = true,
            }
        }

        let mut belt = ConfidenceBelt::from_points(
            self.config.confidence_level,
            self.config.side,
            self.config.nuisance_policy,
            self.test_stat.name(),
            points,
        );
        belt.partial = partial;
        belt.n_failed_points = n_failed;

        log::info!(
            "confidence belt: {} of {} points, {} failed, {} low-confidence, {} unreliable{}",
            belt.len(),
            grid.len(),
            n_failed,
            belt.n_low_confidence(),
            belt.n_unreliable(),
            if partial { " (partial)" } else { "" }
        );
        Ok(belt)
    }

    /// Generation point per scan value; `None` where profiling failed.
    fn generation_points(
        &self,
        grid: &[f64],
        observed: Option<&Dataset>,
    ) -> Result<Vec<Option<ParameterPoint>>> {
        let nominal = self.model.nominal_point()?;
        match self.config.nuisance_policy {
            NuisancePolicy::Nominal => {
                grid.iter().map(|&v| nominal.with_poi(v).map(Some)).collect()
            }
            NuisancePolicy::Profiled => {
                let data = observed.ok_or_else(|| {
                    Error::Validation("profiled nuisances require observed data".into())
                })?;
                // Sequential so each conditional fit warm-starts from its neighbour.
                let mut warm: Option<Vec<f64>> = None;
                let mut out = Vec::with_capacity(grid.len());
                for &v in grid {
                    match self.mle.fit_conditional(self.model, data, v, warm.as_deref()) {
                        Ok(fit) => {
                            if !fit.converged {
                                log::warn!("conditional fit at POI = {v} did not converge: {}", fit.message);
                            }
                            let point = nominal.with_values(fit.parameters.clone())?;
                            warm = Some(fit.parameters);
                            out.push(Some(point));
                        }
                        Err(e) if e.is_recoverable() => {
                            log::warn!("profiling nuisances at POI = {v} failed: {e}");
                            out.push(None);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            }
        }
    }

    fn build_point(&self, poi: f64, point: ParameterPoint) -> Result<PointOutcome> {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            return Ok(PointOutcome::Skipped);
        }
        let stream = self.toys.stream(poi.to_bits());
        let mut builder = SamplingDistributionBuilder::new(self.model, self.test_stat, &stream)
            .keep_nonconverged(self.config.keep_nonconverged);
        if let Some(c) = self.cancel {
            builder = builder.with_cancellation(c);
        }
        let dist = match self.config.toys_in_tail {
            Some(toys_in_tail) => builder.build_adaptive(
                &point,
                self.config.n_toys,
                TailTarget {
                    confidence_level: self.config.confidence_level,
                    side: self.config.side,
                    toys_in_tail,
                    max_toys: self.config.max_toys,
                },
            )?,
            None => builder.build(&point, self.config.n_toys)?,
        };

        let Some((lower, upper)) = dist.acceptance(self.config.confidence_level, self.config.side)
        else {
            if dist.cancelled() {
                return Ok(PointOutcome::Skipped);
            }
            log::warn!("no valid toys at POI = {poi}; point dropped");
            return Ok(PointOutcome::Failed);
        };

        let counts = *dist.counts();
        let low_confidence = counts.n_valid < counts.n_requested;
        let unreliable = !dist.is_reliable(self.config.max_nonconverged_fraction);
        if unreliable {
            log::warn!(
                "POI = {poi}: {:.1}% of toy fits did not converge",
                100.0 * dist.nonconverged_fraction()
            );
        }
        log::debug!("belt point POI = {poi}: [{lower}, {upper}] from {} toys", counts.n_valid);

        Ok(PointOutcome::Done(BeltPoint {
            poi,
            generation_point: point,
            lower,
            upper,
            counts,
            low_confidence,
            unreliable,
        }))
    }
}
