//! Maximum Likelihood Estimation

use crate::optimizer::{BoundedLbfgs, FitMinimum, FitProblem, OptimizerConfig};
use nalgebra::DMatrix;
use nc_core::{Dataset, FitResult, ParametricModel, Result};

/// Maximum Likelihood Estimator
///
/// Fits models by minimizing the negative log-likelihood of a dataset.
#[derive(Debug, Clone, Default)]
pub struct MaximumLikelihoodEstimator {
    config: OptimizerConfig,
}

impl MaximumLikelihoodEstimator {
    /// Create a new MLE with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create MLE with custom optimizer configuration
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Access the optimizer configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Full fit with Hessian-based uncertainties and covariance.
    pub fn fit(&self, model: &dyn ParametricModel, data: &Dataset) -> Result<FitResult> {
        let result = self.fit_minimum(model, data)?;
        let bounds = model.parameter_bounds();
        let free: Vec<usize> = (0..bounds.len()).filter(|&i| bounds[i].1 > bounds[i].0).collect();
        let n = bounds.len();

        let mut uncertainties = vec![0.0; n];
        let mut covariance = vec![0.0; n * n];
        let mut have_cov = false;

        if !free.is_empty() {
            let hessian = self.compute_hessian(model, data, &result.parameters, &free)?;
            match hessian.clone().try_inverse() {
                Some(inv) if (0..free.len()).all(|k| inv[(k, k)].is_finite() && inv[(k, k)] > 0.0) => {
                    for (a, &i) in free.iter().enumerate() {
                        uncertainties[i] = inv[(a, a)].sqrt();
                        for (b, &j) in free.iter().enumerate() {
                            covariance[i * n + j] = inv[(a, b)];
                        }
                    }
                    have_cov = true;
                }
                _ => {
                    log::warn!("Hessian inversion failed, using diagonal approximation");
                    for (a, &i) in free.iter().enumerate() {
                        uncertainties[i] = 1.0 / hessian[(a, a)].abs().max(1e-12).sqrt();
                    }
                }
            }
        }

        let fr = FitResult::new(
            result.parameters,
            uncertainties,
            result.nll,
            result.converged,
            result.n_iter as usize,
            result.n_evaluations,
        );
        Ok(if have_cov { fr.with_covariance(covariance) } else { fr })
    }

    /// Minimize NLL from the model's nominal values.
    ///
    /// Fast path without Hessian; intended for repeated minimizations (toys, scans).
    pub fn fit_minimum(&self, model: &dyn ParametricModel, data: &Dataset) -> Result<FitMinimum> {
        self.minimize(FitProblem::new(model, data))
    }

    /// Minimize NLL with the POI fixed at `poi_value` (profiling the nuisances).
    ///
    /// `warm_start` replaces the nominal start point, typically with the
    /// parameters of a neighbouring fit.
    pub fn fit_conditional(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
        warm_start: Option<&[f64]>,
    ) -> Result<FitMinimum> {
        let mut problem = FitProblem::new(model, data);
        if let Some(start) = warm_start {
            problem = problem.warm_start(start)?;
        }
        self.minimize(problem.fix(model.poi_index(), poi_value)?)
    }

    fn minimize(&self, problem: FitProblem<'_>) -> Result<FitMinimum> {
        BoundedLbfgs::new(self.config.clone()).minimize(problem)
    }

    /// Hessian over the free parameters by forward differences of the gradient.
    fn compute_hessian(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        best_params: &[f64],
        free: &[usize],
    ) -> Result<DMatrix<f64>> {
        let bounds = model.parameter_bounds();
        let grad_center = model.grad_nll(data, best_params)?;
        let k = free.len();
        let mut hessian = DMatrix::zeros(k, k);

        for (b, &j) in free.iter().enumerate() {
            let mut eps = 1e-4 * best_params[j].abs().max(1.0);
            // Step inwards when sitting on the upper bound.
            if best_params[j] + eps > bounds[j].1 {
                eps = -eps;
            }
            let mut params_step = best_params.to_vec();
            params_step[j] += eps;
            let grad_step = model.grad_nll(data, &params_step)?;
            for (a, &i) in free.iter().enumerate() {
                hessian[(a, b)] = (grad_step[i] - grad_center[i]) / eps;
            }
        }

        let ht = hessian.transpose();
        Ok((&hessian + &ht) * 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nc_core::{DatasetKind, ParameterSpec};
    use nc_model::{GaussianMeanModel, OnOffModel, PoissonCountModel};

    fn on_off() -> OnOffModel {
        OnOffModel::new(
            1.0,
            ParameterSpec::new("s", 0.0, 0.0, 100.0).unwrap(),
            ParameterSpec::new("b", 100.0, 0.0, 300.0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_on_off_mle_is_closed_form() {
        // ŝ = x - y/tau, b̂ = y/tau
        let model = on_off();
        let data = Dataset::counts(vec![150.0, 100.0]).unwrap();
        let mle = MaximumLikelihoodEstimator::new();
        let r = mle.fit_minimum(&model, &data).unwrap();
        assert!(r.converged, "{}", r.message);
        assert_relative_eq!(r.parameters[0], 50.0, epsilon = 1e-3);
        assert_relative_eq!(r.parameters[1], 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_conditional_fit_profiles_background() {
        // At s = 0: b̂̂ = (x + y) / (1 + tau) = 125
        let model = on_off();
        let data = Dataset::counts(vec![150.0, 100.0]).unwrap();
        let mle = MaximumLikelihoodEstimator::new();
        let r = mle.fit_conditional(&model, &data, 0.0, None).unwrap();
        assert_eq!(r.parameters[0], 0.0);
        assert_relative_eq!(r.parameters[1], 125.0, epsilon = 1e-3);
        assert!(mle.fit_conditional(&model, &data, 200.0, None).is_err());
    }

    #[test]
    fn test_poi_pinned_at_boundary() {
        let model =
            PoissonCountModel::new(3.0, ParameterSpec::new("mu", 1.0, 0.0, 15.0).unwrap()).unwrap();
        let data = Dataset::counts(vec![1.0]).unwrap();
        let r = MaximumLikelihoodEstimator::new().fit_minimum(&model, &data).unwrap();
        assert!(r.converged, "{}", r.message);
        assert_relative_eq!(r.parameters[0], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_gaussian_fit_uncertainty() {
        let model = GaussianMeanModel::new(
            ParameterSpec::new("mu", 0.0, -5.0, 5.0).unwrap(),
            2.0,
            (-50.0, 50.0),
        )
        .unwrap();
        let xs: Vec<f64> = (0..16).map(|i| -1.5 + 0.2 * i as f64).collect();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        let data = Dataset::new(1, xs, DatasetKind::Fixed).unwrap();
        let fr = MaximumLikelihoodEstimator::new().fit(&model, &data).unwrap();
        assert!(fr.converged);
        assert_relative_eq!(fr.parameters[0], mean, epsilon = 1e-4);
        // sigma / sqrt(n) = 2 / 4
        assert_relative_eq!(fr.uncertainties[0], 0.5, epsilon = 1e-3);
        assert!(fr.covariance.is_some());
    }

    #[test]
    fn test_fixed_parameter_has_zero_uncertainty() {
        let mut b = ParameterSpec::new("b", 100.0, 0.0, 300.0).unwrap();
        b.fixed = true;
        let model =
            OnOffModel::new(1.0, ParameterSpec::new("s", 0.0, 0.0, 100.0).unwrap(), b).unwrap();
        let data = Dataset::counts(vec![150.0, 100.0]).unwrap();
        let fr = MaximumLikelihoodEstimator::new().fit(&model, &data).unwrap();
        assert_eq!(fr.parameters[1], 100.0);
        assert_eq!(fr.uncertainties[1], 0.0);
        // sqrt(150) from the on-region count alone
        assert_relative_eq!(fr.uncertainties[0], 150f64.sqrt(), max_relative = 1e-2);
    }
}
