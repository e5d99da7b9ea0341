//! Analysis configuration.
//!
//! Everything an operator sets before a run, loadable from JSON. Missing keys
//! take their defaults; [`AnalysisConfig::validate`] rejects unusable settings
//! before any toy is thrown.

use crate::belt::{BeltConfig, NuisancePolicy};
use crate::interval::{Interpolation, IntervalInverter, IntervalKind};
use crate::optimizer::OptimizerConfig;
use crate::sampling::AcceptanceSide;
use crate::test_statistic::TestStatisticConfig;
use crate::toys::NuisancePrior;
use nc_core::{CountPolicy, DatasetKind, Dataset, Error, ParametricModel, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// `n` evenly spaced values from `min` to `max` inclusive.
pub fn uniform_grid(min: f64, max: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (n - 1) as f64;
            (0..n).map(|i| if i == n - 1 { max } else { min + step * i as f64 }).collect()
        }
    }
}

/// POI scan definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanConfig {
    /// Evenly spaced points; the range defaults to the POI's bounds.
    Uniform {
        /// Number of points.
        points: usize,
        /// First value.
        #[serde(default)]
        min: Option<f64>,
        /// Last value.
        #[serde(default)]
        max: Option<f64>,
    },
    /// Explicit values.
    Explicit {
        /// Ascending POI values.
        values: Vec<f64>,
    },
    /// Coarse uniform scan, then finer scans inside the brackets of the limits.
    Auto {
        /// First value.
        #[serde(default)]
        min: Option<f64>,
        /// Last value.
        #[serde(default)]
        max: Option<f64>,
        /// Points in the coarse scan.
        coarse_points: usize,
        /// Points per refinement bracket (endpoints included).
        fine_points: usize,
        /// Refinement rounds.
        max_refinements: usize,
    },
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig::Uniform { points: 20, min: None, max: None }
    }
}

impl ScanConfig {
    fn range(min: Option<f64>, max: Option<f64>, bounds: (f64, f64)) -> (f64, f64) {
        (min.unwrap_or(bounds.0), max.unwrap_or(bounds.1))
    }

    /// Initial grid for a POI with range `bounds`.
    pub fn grid(&self, bounds: (f64, f64)) -> Vec<f64> {
        match self {
            ScanConfig::Uniform { points, min, max } => {
                let (lo, hi) = Self::range(*min, *max, bounds);
                uniform_grid(lo, hi, *points)
            }
            ScanConfig::Explicit { values } => values.clone(),
            ScanConfig::Auto { min, max, coarse_points, .. } => {
                let (lo, hi) = Self::range(*min, *max, bounds);
                uniform_grid(lo, hi, *coarse_points)
            }
        }
    }

    /// `(fine_points, max_refinements)` in auto mode.
    pub fn refinement(&self) -> Option<(usize, usize)> {
        match self {
            ScanConfig::Auto { fine_points, max_refinements, .. } => {
                Some((*fine_points, *max_refinements))
            }
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        let check_range = |min: &Option<f64>, max: &Option<f64>| -> Result<()> {
            if let (Some(a), Some(b)) = (min, max) {
                if !(a.is_finite() && b.is_finite() && a < b) {
                    return Err(Error::Validation(format!("scan range [{a}, {b}] is empty")));
                }
            }
            Ok(())
        };
        match self {
            ScanConfig::Uniform { points, min, max } => {
                if *points < 2 {
                    return Err(Error::Validation("uniform scan needs at least 2 points".into()));
                }
                check_range(min, max)
            }
            ScanConfig::Explicit { values } => {
                if values.is_empty() {
                    return Err(Error::Validation("explicit scan has no values".into()));
                }
                Ok(())
            }
            ScanConfig::Auto { min, max, coarse_points, fine_points, .. } => {
                if *coarse_points < 2 || *fine_points < 3 {
                    return Err(Error::Validation(
                        "auto scan needs coarse_points >= 2 and fine_points >= 3".into(),
                    ));
                }
                check_range(min, max)
            }
        }
    }
}

/// Options for a full Neyman-construction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Confidence level.
    pub confidence_level: f64,
    /// Toys per scan point.
    pub n_toys_per_point: usize,
    /// Adaptive mode: toys required outside the acceptance region.
    pub toys_in_tail: Option<usize>,
    /// Adaptive mode: cap on toys per point.
    pub max_toys_per_point: usize,
    /// POI scan.
    pub scan: ScanConfig,
    /// Limits to report.
    pub interval: IntervalKind,
    /// Acceptance side of the belt.
    pub acceptance: AcceptanceSide,
    /// Refinement between grid points.
    pub interpolation: Interpolation,
    /// Test statistic.
    pub test_statistic: TestStatisticConfig,
    /// Entry-count policy for toys; chosen from the model when absent.
    pub count_policy: Option<CountPolicy>,
    /// Generation-point nuisances.
    pub nuisance_policy: NuisancePolicy,
    /// Per-nuisance priors for hybrid toys, by parameter name.
    pub nuisance_priors: BTreeMap<String, NuisancePrior>,
    /// Expected-band toys; 0 skips the bands.
    pub n_toy_mc: usize,
    /// POI value of the background-only reference point (POI minimum when absent).
    pub reference_poi: Option<f64>,
    /// Base seed; a random one is drawn when absent.
    pub seed: Option<u64>,
    /// Worker threads; rayon's global pool when absent.
    pub threads: Option<usize>,
    /// Non-convergence fraction above which a point is unreliable.
    pub max_nonconverged_fraction: f64,
    /// Keep (flagged) samples from non-converged fits.
    pub keep_nonconverged: bool,
    /// Optimizer settings for every fit.
    pub optimizer: OptimizerConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            n_toys_per_point: 1000,
            toys_in_tail: None,
            max_toys_per_point: 20_000,
            scan: ScanConfig::default(),
            interval: IntervalKind::UpperLimit,
            acceptance: AcceptanceSide::Upper,
            interpolation: Interpolation::Linear,
            test_statistic: TestStatisticConfig::default(),
            count_policy: None,
            nuisance_policy: NuisancePolicy::Profiled,
            nuisance_priors: BTreeMap::new(),
            n_toy_mc: 200,
            reference_poi: None,
            seed: None,
            threads: None,
            max_nonconverged_fraction: 0.1,
            keep_nonconverged: true,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(Error::Validation(format!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.n_toys_per_point == 0 {
            return Err(Error::Validation("n_toys_per_point must be > 0".into()));
        }
        if self.toys_in_tail == Some(0) {
            return Err(Error::Validation("toys_in_tail must be > 0 when set".into()));
        }
        if self.toys_in_tail.is_some() && self.max_toys_per_point < self.n_toys_per_point {
            return Err(Error::Validation(
                "max_toys_per_point must be >= n_toys_per_point".into(),
            ));
        }
        if self.threads == Some(0) {
            return Err(Error::Validation("threads must be > 0 when set".into()));
        }
        if let Some(r) = self.reference_poi {
            if !r.is_finite() {
                return Err(Error::Validation(format!("reference_poi must be finite, got {r}")));
            }
        }
        if !(0.0..=1.0).contains(&self.max_nonconverged_fraction) {
            return Err(Error::Validation(format!(
                "max_nonconverged_fraction must be in [0, 1], got {}",
                self.max_nonconverged_fraction
            )));
        }
        if let Some(CountPolicy::FixedCount(0)) = self.count_policy {
            return Err(Error::Validation("fixed_count must be > 0".into()));
        }
        self.scan.validate()?;
        self.optimizer.validate()
    }

    /// Count policy to use for `model`, falling back to its natural one.
    ///
    /// Unbinned models without an expected yield reuse the observed entry count.
    pub fn resolve_count_policy(
        &self,
        model: &dyn ParametricModel,
        observed: &Dataset,
    ) -> CountPolicy {
        if let Some(p) = self.count_policy {
            return p;
        }
        if model.is_number_counting() {
            CountPolicy::NumberCounting
        } else if model.can_be_extended() && observed.kind() != DatasetKind::Fixed {
            CountPolicy::Extended
        } else {
            CountPolicy::FixedCount(observed.n_entries())
        }
    }

    /// Belt settings.
    pub fn belt_config(&self) -> BeltConfig {
        BeltConfig {
            confidence_level: self.confidence_level,
            side: self.acceptance,
            nuisance_policy: self.nuisance_policy,
            n_toys: self.n_toys_per_point,
            toys_in_tail: self.toys_in_tail,
            max_toys: self.max_toys_per_point,
            keep_nonconverged: self.keep_nonconverged,
            max_nonconverged_fraction: self.max_nonconverged_fraction,
        }
    }

    /// Inverter settings.
    pub fn inverter(&self) -> IntervalInverter {
        IntervalInverter::new(self.interval, self.interpolation)
    }
}
