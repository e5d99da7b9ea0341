//! Interval inversion.
//!
//! The observed statistic is compared against every belt point's acceptance
//! region (inclusive on both thresholds). The interval is the range of POI values
//! whose regions accept it; limits are refined by linear interpolation of the
//! acceptance margin between the bracketing grid points.

use crate::belt::ConfidenceBelt;
use crate::test_statistic::TestStatistic;
use nc_core::{Dataset, Error, ParametricModel, Result};
use serde::{Deserialize, Serialize};

/// Which limits are wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    /// Upper limit; the lower limit is the POI's natural lower bound.
    #[default]
    UpperLimit,
    /// Lower limit; the upper limit is the POI's upper bound.
    LowerLimit,
    /// Both limits from the belt.
    TwoSided,
}

/// Refinement between grid points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Report the last accepted grid point; the error is the grid spacing.
    None,
    /// Interpolate the acceptance margin linearly; the error is half the spacing.
    #[default]
    Linear,
}

/// How a limit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStatus {
    /// Transition found between two grid points.
    Bracketed,
    /// The POI's range boundary.
    NaturalBoundary,
    /// Accepted up to the edge of the scanned grid; the true limit lies beyond it.
    OpenAtScanEdge,
    /// Nothing accepted anywhere on the grid.
    Undefined,
}

/// One end of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    /// Limit value (`NaN` when undefined).
    pub value: f64,
    /// Scan-resolution error estimate.
    pub error: f64,
    /// How the value was obtained.
    pub status: LimitStatus,
    /// Grid points bracketing the transition, when bracketed.
    pub bracket: Option<(f64, f64)>,
}

impl Limit {
    fn boundary(value: f64) -> Self {
        Self { value, error: 0.0, status: LimitStatus::NaturalBoundary, bracket: None }
    }

    fn undefined() -> Self {
        Self { value: f64::NAN, error: f64::NAN, status: LimitStatus::Undefined, bracket: None }
    }

    /// The limit is a number (anything but [`LimitStatus::Undefined`]).
    pub fn is_defined(&self) -> bool {
        self.status != LimitStatus::Undefined
    }
}

/// Inverted confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower limit.
    pub lower: Limit,
    /// Upper limit.
    pub upper: Limit,
    /// Confidence level of the belt.
    pub confidence_level: f64,
    /// Inverted against a partial belt.
    pub partial: bool,
}

impl ConfidenceInterval {
    /// `lower <= value <= upper`.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower.value && value <= self.upper.value
    }

    /// `upper - lower`.
    pub fn width(&self) -> f64 {
        self.upper.value - self.lower.value
    }

    /// Both limits defined.
    pub fn is_defined(&self) -> bool {
        self.lower.is_defined() && self.upper.is_defined()
    }
}

/// Observed statistic at each belt POI value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedScan {
    /// `(poi, t)` in ascending POI order.
    pub points: Vec<(f64, f64)>,
    /// Scan points whose evaluation failed.
    pub n_failed: usize,
    /// Every fit converged.
    pub converged: bool,
}

impl ObservedScan {
    /// The same statistic value at every POI.
    pub fn constant(poi_values: &[f64], t: f64) -> Self {
        Self { points: poi_values.iter().map(|&v| (v, t)).collect(), n_failed: 0, converged: true }
    }
}

/// Evaluate the statistic on `data` at every belt POI value.
///
/// Recoverable failures drop the affected point and are counted.
pub fn observed_scan(
    model: &dyn ParametricModel,
    stat: &dyn TestStatistic,
    data: &Dataset,
    belt: &ConfidenceBelt,
) -> Result<ObservedScan> {
    let grid = belt.poi_values();
    if !stat.depends_on_poi() {
        let Some(&first) = grid.first() else {
            return Ok(ObservedScan::constant(&grid, f64::NAN));
        };
        let v = stat.evaluate(model, data, first)?;
        let mut scan = ObservedScan::constant(&grid, v.value);
        scan.converged = v.converged;
        return Ok(scan);
    }

    match stat.evaluate_scan(model, data, &grid) {
        Ok(values) => Ok(ObservedScan {
            converged: values.iter().all(|v| v.converged),
            points: values.into_iter().map(|v| (v.poi_value, v.value)).collect(),
            n_failed: 0,
        }),
        Err(e) if e.is_recoverable() => {
            log::warn!("observed scan failed ({e}); evaluating point by point");
            let mut scan = ObservedScan { points: Vec::new(), n_failed: 0, converged: true };
            for &poi in &grid {
                match stat.evaluate(model, data, poi) {
                    Ok(v) if v.value.is_finite() => {
                        scan.converged &= v.converged;
                        scan.points.push((poi, v.value));
                    }
                    Ok(_) => scan.n_failed += 1,
                    Err(e) if e.is_recoverable() => {
                        log::warn!("observed statistic at POI = {poi} failed: {e}");
                        scan.n_failed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(scan)
        }
        Err(e) => Err(e),
    }
}

/// POI value where the margin crosses zero between `(va, ma)` and `(vb, mb)`.
fn crossing(va: f64, ma: f64, vb: f64, mb: f64) -> f64 {
    va + (vb - va) * ma / (ma - mb)
}

/// Turns a belt plus observed statistics into a [`ConfidenceInterval`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalInverter {
    /// Limits to compute.
    pub kind: IntervalKind,
    /// Refinement between grid points.
    pub interpolation: Interpolation,
}

impl IntervalInverter {
    /// Inverter for `kind` with `interpolation`.
    pub fn new(kind: IntervalKind, interpolation: Interpolation) -> Self {
        Self { kind, interpolation }
    }

    /// Invert with the same statistic value at every POI (POI-independent statistics).
    pub fn invert_value(&self, belt: &ConfidenceBelt, t: f64) -> Result<ConfidenceInterval> {
        self.invert(belt, &ObservedScan::constant(&belt.poi_values(), t))
    }

    /// Invert the observed scan against `belt`.
    pub fn invert(&self, belt: &ConfidenceBelt, scan: &ObservedScan) -> Result<ConfidenceInterval> {
        let first = belt
            .points()
            .first()
            .ok_or_else(|| Error::Computation("cannot invert an empty confidence belt".into()))?;
        let (poi_min, poi_max) = first.generation_point.poi_bounds();

        // (poi, margin) over points present in both belt and scan.
        let margins: Vec<(f64, f64)> = scan
            .points
            .iter()
            .filter_map(|&(poi, t)| belt.point_at(poi).map(|p| (poi, p.margin(t))))
            .filter(|(_, m)| !m.is_nan())
            .collect();

        let first_acc = margins.iter().position(|(_, m)| *m >= 0.0);
        let last_acc = margins.iter().rposition(|(_, m)| *m >= 0.0);

        let (lower, upper) = match (first_acc, last_acc) {
            (Some(f), Some(u)) => {
                let lower = match self.kind {
                    IntervalKind::UpperLimit => Limit::boundary(poi_min),
                    IntervalKind::LowerLimit | IntervalKind::TwoSided => {
                        self.edge_limit(&margins, f, false, poi_min)
                    }
                };
                let upper = match self.kind {
                    IntervalKind::LowerLimit => Limit::boundary(poi_max),
                    IntervalKind::UpperLimit | IntervalKind::TwoSided => {
                        self.edge_limit(&margins, u, true, poi_max)
                    }
                };
                (lower, upper)
            }
            _ => {
                log::warn!("observed statistic rejected at every scanned POI value");
                let lower = match self.kind {
                    IntervalKind::UpperLimit => Limit::boundary(poi_min),
                    _ => Limit::undefined(),
                };
                let upper = match self.kind {
                    IntervalKind::LowerLimit => Limit::boundary(poi_max),
                    _ => Limit::undefined(),
                };
                (lower, upper)
            }
        };

        Ok(ConfidenceInterval {
            lower,
            upper,
            confidence_level: belt.confidence_level(),
            partial: belt.is_partial(),
        })
    }

    /// Limit at accepted index `k`, looking upwards (`up`) or downwards for the
    /// neighbouring rejected point.
    fn edge_limit(&self, margins: &[(f64, f64)], k: usize, up: bool, natural: f64) -> Limit {
        let (vk, mk) = margins[k];
        let neighbour = if up { margins.get(k + 1) } else { k.checked_sub(1).map(|i| &margins[i]) };
        let Some(&(vn, mn)) = neighbour else {
            if vk == natural {
                return Limit::boundary(natural);
            }
            let spacing = if up {
                k.checked_sub(1).map(|i| vk - margins[i].0)
            } else {
                margins.get(k + 1).map(|n| n.0 - vk)
            };
            log::warn!("limit open at scan edge {vk}; extend the scan range");
            return Limit {
                value: vk,
                error: spacing.unwrap_or(f64::NAN),
                status: LimitStatus::OpenAtScanEdge,
                bracket: None,
            };
        };
        let spacing = (vn - vk).abs();
        let (value, error) = match self.interpolation {
            Interpolation::None => (vk, spacing),
            Interpolation::Linear => (crossing(vk, mk, vn, mn), 0.5 * spacing),
        };
        let bracket = if vk < vn { (vk, vn) } else { (vn, vk) };
        Limit { value, error, status: LimitStatus::Bracketed, bracket: Some(bracket) }
    }
}
