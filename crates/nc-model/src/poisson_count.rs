//! Single-channel Poisson count with a known background.

use crate::draw;
use nc_core::{CountPolicy, Dataset, DatasetKind, Error, ParameterSpec, ParametricModel, Result};
use nc_prob::math::MIN_POISSON_MEAN;
use nc_prob::poisson;
use rand::RngCore;

/// `x ~ Pois(mu + background)`.
#[derive(Debug, Clone)]
pub struct PoissonCountModel {
    background: f64,
    params: Vec<ParameterSpec>,
}

impl PoissonCountModel {
    /// `signal` is the POI; `background` is known exactly.
    pub fn new(background: f64, signal: ParameterSpec) -> Result<Self> {
        if !background.is_finite() || background < 0.0 {
            return Err(Error::Validation(format!(
                "poisson count: background must be >= 0, got {background}"
            )));
        }
        if signal.bounds.0 + background < 0.0 {
            return Err(Error::Validation(
                "poisson count: total mean can become negative".into(),
            ));
        }
        Ok(Self { background, params: vec![signal] })
    }

    /// Known background mean.
    pub fn background(&self) -> f64 {
        self.background
    }

    fn count(&self, data: &Dataset) -> Result<u64> {
        if data.kind() != DatasetKind::NumberCounting || data.n_observables() != 1 {
            return Err(Error::Validation(
                "poisson count: expected a one-observable number-counting dataset".into(),
            ));
        }
        poisson::as_count(data.entry(0)[0])
    }
}

impl ParametricModel for PoissonCountModel {
    fn name(&self) -> &str {
        "poisson_count"
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.params
    }

    fn poi_index(&self) -> usize {
        0
    }

    fn observable_names(&self) -> Vec<String> {
        vec!["x".into()]
    }

    fn is_number_counting(&self) -> bool {
        true
    }

    fn can_be_extended(&self) -> bool {
        false
    }

    fn expected_events(&self, _params: &[f64]) -> Result<f64> {
        Err(Error::Validation("poisson count: number-counting model has no entry yield".into()))
    }

    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        let x = self.count(data)?;
        poisson::logpmf(x, (params[0] + self.background).max(MIN_POISSON_MEAN))
    }

    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        let x = self.count(data)?;
        let lam = (params[0] + self.background).max(MIN_POISSON_MEAN);
        Ok(vec![1.0 - x as f64 / lam])
    }

    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset> {
        draw::require_single_entry(self.name(), policy)?;
        self.check_params(params)?;
        let x = draw::poisson(params[0] + self.background, rng)?;
        Dataset::counts(vec![x])
    }
}
