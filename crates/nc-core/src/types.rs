//! Common data types: parameters, parameter points, datasets, fit results.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Declaration of one model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name (unique within a model).
    pub name: String,
    /// Nominal / initial value.
    pub init: f64,
    /// Allowed range `(min, max)`, inclusive.
    pub bounds: (f64, f64),
    /// Held constant at `init` in every fit.
    #[serde(default)]
    pub fixed: bool,
}

impl ParameterSpec {
    /// Floating parameter with a validated range.
    pub fn new(name: impl Into<String>, init: f64, min: f64, max: f64) -> Result<Self> {
        let name = name.into();
        if !(min.is_finite() && max.is_finite() && init.is_finite()) {
            return Err(Error::Validation(format!(
                "parameter '{name}': non-finite range or init ({min}, {max}, {init})"
            )));
        }
        if min > max {
            return Err(Error::Validation(format!(
                "parameter '{name}': min {min} > max {max}"
            )));
        }
        if init < min || init > max {
            return Err(Error::Validation(format!(
                "parameter '{name}': init {init} outside [{min}, {max}]"
            )));
        }
        Ok(Self { name, init, bounds: (min, max), fixed: false })
    }

    /// Parameter held constant at `value`.
    pub fn constant(name: impl Into<String>, value: f64) -> Result<Self> {
        let mut p = Self::new(name, value, value, value)?;
        p.fixed = true;
        Ok(p)
    }

    /// Whether `value` lies inside the declared range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.bounds.0 && value <= self.bounds.1
    }

    /// Bounds used by the optimizer (collapsed to `init` when fixed).
    pub fn fit_bounds(&self) -> (f64, f64) {
        if self.fixed { (self.init, self.init) } else { self.bounds }
    }
}

/// A full assignment of values to every model parameter.
///
/// Construction is range-checked against the model's [`ParameterSpec`]s, so a
/// `ParameterPoint` always satisfies `min <= value <= max` for each parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterPoint {
    names: Vec<String>,
    bounds: Vec<(f64, f64)>,
    values: Vec<f64>,
    poi: usize,
}

impl ParameterPoint {
    /// Build a point from parameter declarations and values.
    pub fn new(specs: &[ParameterSpec], poi: usize, values: Vec<f64>) -> Result<Self> {
        if values.len() != specs.len() {
            return Err(Error::Validation(format!(
                "parameter point has {} values, model declares {} parameters",
                values.len(),
                specs.len()
            )));
        }
        if poi >= specs.len() {
            return Err(Error::Validation(format!(
                "POI index {poi} out of range for {} parameters",
                specs.len()
            )));
        }
        for (spec, &v) in specs.iter().zip(values.iter()) {
            if !v.is_finite() || !spec.contains(v) {
                return Err(Error::Validation(format!(
                    "parameter '{}' = {v} outside [{}, {}]",
                    spec.name, spec.bounds.0, spec.bounds.1
                )));
            }
        }
        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            bounds: specs.iter().map(|s| s.bounds).collect(),
            values,
            poi,
        })
    }

    /// Point at every parameter's nominal value.
    pub fn nominal(specs: &[ParameterSpec], poi: usize) -> Result<Self> {
        Self::new(specs, poi, specs.iter().map(|s| s.init).collect())
    }

    /// Copy with the POI replaced (range-checked).
    pub fn with_poi(&self, value: f64) -> Result<Self> {
        self.with_value(self.poi, value)
    }

    /// Copy with parameter `index` replaced (range-checked).
    pub fn with_value(&self, index: usize, value: f64) -> Result<Self> {
        let (lo, hi) = *self.bounds.get(index).ok_or_else(|| {
            Error::Validation(format!("parameter index {index} out of range"))
        })?;
        if !value.is_finite() || value < lo || value > hi {
            return Err(Error::Validation(format!(
                "parameter '{}' = {value} outside [{lo}, {hi}]",
                self.names[index]
            )));
        }
        let mut out = self.clone();
        out.values[index] = value;
        Ok(out)
    }

    /// Copy with all values replaced (range-checked).
    pub fn with_values(&self, values: Vec<f64>) -> Result<Self> {
        if values.len() != self.values.len() {
            return Err(Error::Validation(format!(
                "expected {} values, got {}",
                self.values.len(),
                values.len()
            )));
        }
        let mut out = self.clone();
        for (i, v) in values.into_iter().enumerate() {
            out = out.with_value(i, v)?;
        }
        Ok(out)
    }

    /// All parameter values, in model order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Parameter names, in model order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Index of the parameter of interest.
    pub fn poi_index(&self) -> usize {
        self.poi
    }

    /// Value of the parameter of interest.
    pub fn poi_value(&self) -> f64 {
        self.values[self.poi]
    }

    /// Range of the parameter of interest.
    pub fn poi_bounds(&self) -> (f64, f64) {
        self.bounds[self.poi]
    }

    /// Value of the named parameter.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.values[i])
    }

    /// `(name, value)` of every nuisance parameter.
    pub fn nuisances(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .zip(self.values.iter())
            .enumerate()
            .filter(move |(i, _)| *i != self.poi)
            .map(|(_, (n, &v))| (n.as_str(), v))
    }
}

/// How the number of entries in a toy dataset is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// Exactly `n` entries.
    FixedCount(usize),
    /// Entry count drawn from a Poisson with the model's expected yield.
    Extended,
    /// A single entry whose observables are themselves Poisson counts.
    NumberCounting,
}

/// Likelihood semantics attached to a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// One entry of Poisson-distributed counts.
    NumberCounting,
    /// Unbinned entries; the likelihood includes a Poisson term on the entry count.
    Extended,
    /// Unbinned entries with a fixed, non-random count.
    Fixed,
}

/// An immutable collection of observed (or generated) entries.
///
/// Values are stored row-major: entry `i` occupies
/// `values[i * n_observables .. (i + 1) * n_observables]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    n_observables: usize,
    values: Vec<f64>,
    kind: DatasetKind,
}

impl Dataset {
    /// Build a dataset, validating shape and finiteness.
    pub fn new(n_observables: usize, values: Vec<f64>, kind: DatasetKind) -> Result<Self> {
        if n_observables == 0 {
            return Err(Error::Validation("dataset needs at least one observable".into()));
        }
        if values.len() % n_observables != 0 {
            return Err(Error::Validation(format!(
                "dataset length {} is not a multiple of {n_observables} observables",
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("dataset contains non-finite value {bad}")));
        }
        if kind == DatasetKind::NumberCounting {
            if values.len() != n_observables {
                return Err(Error::Validation(format!(
                    "number-counting dataset must have exactly one entry, got {}",
                    values.len() / n_observables
                )));
            }
            if let Some(bad) = values.iter().find(|v| **v < 0.0 || v.fract() != 0.0) {
                return Err(Error::Validation(format!(
                    "number-counting observables must be non-negative integers, got {bad}"
                )));
            }
        }
        Ok(Self { n_observables, values, kind })
    }

    /// Single-entry number-counting dataset.
    pub fn counts(counts: Vec<f64>) -> Result<Self> {
        let n = counts.len();
        Self::new(n, counts, DatasetKind::NumberCounting)
    }

    /// Number of observables per entry.
    pub fn n_observables(&self) -> usize {
        self.n_observables
    }

    /// Number of entries.
    pub fn n_entries(&self) -> usize {
        self.values.len() / self.n_observables
    }

    /// Likelihood semantics.
    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    /// Entry `i`.
    pub fn entry(&self, i: usize) -> &[f64] {
        let k = self.n_observables;
        &self.values[i * k..(i + 1) * k]
    }

    /// Iterate entries.
    pub fn entries(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.values.chunks_exact(self.n_observables)
    }

    /// Iterate observable `j` across entries.
    pub fn column(&self, j: usize) -> impl Iterator<Item = f64> + '_ {
        self.entries().map(move |e| e[j])
    }

    /// Raw row-major values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal, 0 for fixed parameters)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Negative log-likelihood at minimum
    pub nll: f64,

    /// Convergence status
    pub converged: bool,

    /// Number of optimizer iterations
    pub n_iter: usize,

    /// Number of function evaluations
    pub n_evaluations: usize,
}

impl FitResult {
    /// Create a new fit result
    pub fn new(
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        nll: f64,
        converged: bool,
        n_iter: usize,
        n_evaluations: usize,
    ) -> Self {
        Self { parameters, uncertainties, covariance: None, nll, converged, n_iter, n_evaluations }
    }

    /// Attach a row-major covariance matrix.
    pub fn with_covariance(mut self, covariance: Vec<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }
}
