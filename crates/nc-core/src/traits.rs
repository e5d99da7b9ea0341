//! Core traits for the Neyman-construction crates
//!
//! Inference code (fits, test statistics, belts) only sees [`ParametricModel`];
//! concrete likelihoods live in `nc-model` and in user code.

use crate::types::{CountPolicy, Dataset, ParameterPoint, ParameterSpec};
use crate::{Error, Result};
use rand::RngCore;

/// A parametric family of probability densities over datasets.
///
/// Implementations must be `Send + Sync`: toys and scan points are evaluated
/// concurrently against a shared model reference.
pub trait ParametricModel: Send + Sync {
    /// Short model name used in logs and reports.
    fn name(&self) -> &str;

    /// Parameter declarations, in evaluation order.
    fn parameters(&self) -> &[ParameterSpec];

    /// Index of the parameter of interest in [`ParametricModel::parameters`].
    fn poi_index(&self) -> usize;

    /// Names of the observables in one dataset entry.
    fn observable_names(&self) -> Vec<String>;

    /// Whether datasets are single entries of Poisson counts.
    fn is_number_counting(&self) -> bool;

    /// Whether the model predicts an expected number of entries.
    fn can_be_extended(&self) -> bool;

    /// Expected number of entries at `params` (extended models only).
    fn expected_events(&self, params: &[f64]) -> Result<f64>;

    /// Log-likelihood of `data` at `params`.
    ///
    /// Out-of-range parameters and zero densities are reported as
    /// [`Error::ModelEvaluation`], never as a panic or `-inf`.
    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64>;

    /// Draw one dataset at `params` using `policy` for the entry count.
    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset>;

    /// Negative log-likelihood.
    fn nll(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        Ok(-self.log_likelihood(data, params)?)
    }

    /// Gradient of the NLL.
    ///
    /// Default: central differences, shrunk to one-sided steps at range edges so
    /// the model is never evaluated outside its declared bounds.
    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        let bounds = self.parameter_bounds();
        let mut grad = vec![0.0; params.len()];
        let mut work = params.to_vec();
        for i in 0..params.len() {
            let (lo, hi) = bounds[i];
            if hi <= lo {
                continue;
            }
            let h = 1e-6 * params[i].abs().max(1.0);
            let up = (params[i] + h).min(hi);
            let dn = (params[i] - h).max(lo);
            work[i] = up;
            let f_up = self.nll(data, &work)?;
            work[i] = dn;
            let f_dn = self.nll(data, &work)?;
            work[i] = params[i];
            grad[i] = (f_up - f_dn) / (up - dn);
        }
        Ok(grad)
    }

    /// Number of parameters.
    fn dim(&self) -> usize {
        self.parameters().len()
    }

    /// Parameter names.
    fn parameter_names(&self) -> Vec<String> {
        self.parameters().iter().map(|p| p.name.clone()).collect()
    }

    /// Optimizer bounds; fixed parameters collapse to `(init, init)`.
    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.parameters().iter().map(|p| p.fit_bounds()).collect()
    }

    /// Nominal parameter values.
    fn parameter_init(&self) -> Vec<f64> {
        self.parameters().iter().map(|p| p.init).collect()
    }

    /// Range of the parameter of interest.
    fn poi_bounds(&self) -> (f64, f64) {
        self.parameters()[self.poi_index()].bounds
    }

    /// Nominal point.
    fn nominal_point(&self) -> Result<ParameterPoint> {
        ParameterPoint::nominal(self.parameters(), self.poi_index())
    }

    /// Range-checked point from raw values.
    fn point(&self, values: Vec<f64>) -> Result<ParameterPoint> {
        ParameterPoint::new(self.parameters(), self.poi_index(), values)
    }

    /// Reject parameter vectors outside the declared ranges.
    fn check_params(&self, params: &[f64]) -> Result<()> {
        let specs = self.parameters();
        if params.len() != specs.len() {
            return Err(Error::ModelEvaluation(format!(
                "{}: expected {} parameters, got {}",
                self.name(),
                specs.len(),
                params.len()
            )));
        }
        for (spec, &v) in specs.iter().zip(params.iter()) {
            if !v.is_finite() || !spec.contains(v) {
                return Err(Error::ModelEvaluation(format!(
                    "{}: parameter '{}' = {v} outside [{}, {}]",
                    self.name(),
                    spec.name,
                    spec.bounds.0,
                    spec.bounds.1
                )));
            }
        }
        Ok(())
    }

    /// Probability (density) of `data` at `point`.
    fn density(&self, data: &Dataset, point: &ParameterPoint) -> Result<f64> {
        Ok(self.log_likelihood(data, point.values())?.exp())
    }
}
