//! Bounded NLL minimization
//!
//! A [`FitProblem`] ties one model to one dataset together with the box the
//! fit may explore and the point it starts from. [`BoundedLbfgs`] drives
//! argmin's L-BFGS over it: every trial point is projected onto the box and
//! gradient components pointing out of an active face are dropped.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use nc_core::{Dataset, Error, ParametricModel, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Distance below which a coordinate counts as sitting on its bound.
const ACTIVE_FACE: f64 = 1e-12;

/// L-BFGS settings shared by every fit of an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Iteration cap per minimization.
    pub max_iter: u64,
    /// Projected-gradient norm at which a fit is converged.
    pub tol: f64,
    /// L-BFGS history length.
    pub m: usize,
    /// Wall-clock budget per minimization; exceeding it reports non-convergence.
    pub max_duration_ms: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10, max_duration_ms: None }
    }
}

impl OptimizerConfig {
    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Validation("optimizer max_iter must be > 0".into()));
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(Error::Validation(format!("optimizer tol must be >= 0, got {}", self.tol)));
        }
        if self.m == 0 {
            return Err(Error::Validation("optimizer history size m must be > 0".into()));
        }
        if self.max_duration_ms == Some(0) {
            return Err(Error::Validation("optimizer max_duration_ms must be > 0".into()));
        }
        Ok(())
    }

    fn budget(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    /// argmin's default cost tolerance (~EPS) is far too strict for NLL scales.
    fn cost_tolerance(&self) -> f64 {
        if self.tol == 0.0 { 0.0 } else { (0.1 * self.tol).max(1e-12) }
    }
}

/// Where a fit ended up.
#[derive(Debug, Clone)]
pub struct FitMinimum {
    /// Parameter values at the minimum, inside the problem's box.
    pub parameters: Vec<f64>,
    /// NLL at `parameters`.
    pub nll: f64,
    /// L-BFGS iterations taken.
    pub n_iter: u64,
    /// NLL plus gradient evaluations.
    pub n_evaluations: usize,
    /// The solver met its gradient or cost tolerance.
    pub converged: bool,
    /// argmin's termination reason.
    pub message: String,
}

/// One NLL minimization: model, dataset, box and start point.
pub struct FitProblem<'a> {
    model: &'a dyn ParametricModel,
    data: &'a Dataset,
    bounds: Vec<(f64, f64)>,
    start: Vec<f64>,
}

impl<'a> FitProblem<'a> {
    /// Fit over the model's declared ranges, starting at its nominal values.
    pub fn new(model: &'a dyn ParametricModel, data: &'a Dataset) -> Self {
        Self { model, data, bounds: model.parameter_bounds(), start: model.parameter_init() }
    }

    /// Start from `start` instead of the nominal values (projected onto the box).
    pub fn warm_start(mut self, start: &[f64]) -> Result<Self> {
        if start.len() != self.bounds.len() {
            return Err(Error::Validation(format!(
                "{}: start point has {} values, model has {} parameters",
                self.model.name(),
                start.len(),
                self.bounds.len()
            )));
        }
        self.start = start.to_vec();
        Ok(self)
    }

    /// Pin parameter `index` at `value` for this fit.
    pub fn fix(mut self, index: usize, value: f64) -> Result<Self> {
        let spec = self.model.parameters().get(index).ok_or_else(|| {
            Error::Validation(format!("{}: no parameter at index {index}", self.model.name()))
        })?;
        if !value.is_finite() || !spec.contains(value) {
            return Err(Error::Validation(format!(
                "{}: cannot fix '{}' at {value} outside [{}, {}]",
                self.model.name(),
                spec.name,
                spec.bounds.0,
                spec.bounds.1
            )));
        }
        self.bounds[index] = (value, value);
        self.start[index] = value;
        Ok(self)
    }

    fn project(&self, params: &[f64]) -> Vec<f64> {
        params.iter().zip(&self.bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
    }

    fn has_free_parameters(&self) -> bool {
        self.bounds.iter().any(|&(lo, hi)| hi > lo)
    }

    fn nll_at(&self, params: &[f64]) -> Result<f64> {
        self.model.nll(self.data, &self.project(params))
    }
}

impl CostFunction for FitProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        self.nll_at(params).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for FitProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        let x = self.project(params);
        let mut g = self
            .model
            .grad_nll(self.data, &x)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        for ((gi, &xi), &(lo, hi)) in g.iter_mut().zip(&x).zip(&self.bounds) {
            let on_lower = xi <= lo + ACTIVE_FACE && *gi > 0.0;
            let on_upper = xi >= hi - ACTIVE_FACE && *gi < 0.0;
            if on_lower || on_upper {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

/// Projected L-BFGS over a [`FitProblem`].
#[derive(Debug, Clone, Default)]
pub struct BoundedLbfgs {
    config: OptimizerConfig,
}

impl BoundedLbfgs {
    /// Optimizer with the given settings.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize the problem's NLL.
    ///
    /// A problem with every parameter pinned is evaluated once and reported as
    /// converged. Line-search failures, model errors inside the fit and a
    /// non-finite minimum surface as [`Error::NonConvergence`].
    pub fn minimize(&self, problem: FitProblem<'_>) -> Result<FitMinimum> {
        let start = problem.project(&problem.start);
        let model_name = problem.model.name().to_string();

        if !problem.has_free_parameters() {
            let nll = problem.nll_at(&start)?;
            return Ok(FitMinimum {
                parameters: start,
                nll,
                n_iter: 0,
                n_evaluations: 1,
                converged: true,
                message: "no free parameters".into(),
            });
        }

        let bounds = problem.bounds.clone();
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(self.config.cost_tolerance()))
            .map_err(|e| Error::Validation(format!("invalid optimizer tolerance: {e}")))?;

        let max_iter = self.config.max_iter;
        let mut executor =
            Executor::new(problem, solver).configure(|state| state.param(start).max_iters(max_iter));
        if let Some(budget) = self.config.budget() {
            executor = executor.timeout(budget);
        }
        let run = executor
            .run()
            .map_err(|e| Error::NonConvergence(format!("{model_name}: fit aborted: {e}")))?;

        let state = run.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::NonConvergence(format!("{model_name}: fit produced no point")))?;
        let parameters: Vec<f64> =
            best.iter().zip(&bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect();
        let nll = state.get_best_cost();
        if !nll.is_finite() {
            return Err(Error::NonConvergence(format!("{model_name}: non-finite NLL at minimum ({nll})")));
        }
        let counts = state.get_func_counts();
        let n_evaluations = ["cost_count", "gradient_count"]
            .iter()
            .map(|k| counts.get(*k).copied().unwrap_or(0) as usize)
            .sum();
        let status = state.get_termination_status();
        let converged = matches!(
            status,
            TerminationStatus::Terminated(
                TerminationReason::SolverConverged | TerminationReason::TargetCostReached
            )
        );

        Ok(FitMinimum {
            parameters,
            nll,
            n_iter: state.get_iter(),
            n_evaluations,
            converged,
            message: status.to_string(),
        })
    }
}
