//! On/off counting experiment.
//!
//! `x ~ Pois(s + b)` in the signal region, `y ~ Pois(tau * b)` in a control region
//! that measures the background with a known scale factor `tau`.

use crate::draw;
use nc_core::{CountPolicy, Dataset, DatasetKind, Error, ParameterSpec, ParametricModel, Result};
use nc_prob::math::MIN_POISSON_MEAN;
use nc_prob::poisson;
use rand::RngCore;

/// Signal-plus-background counting model with an auxiliary background measurement.
#[derive(Debug, Clone)]
pub struct OnOffModel {
    tau: f64,
    params: Vec<ParameterSpec>,
}

impl OnOffModel {
    /// `signal` is the POI, `background` the nuisance.
    pub fn new(tau: f64, signal: ParameterSpec, background: ParameterSpec) -> Result<Self> {
        if !tau.is_finite() || tau <= 0.0 {
            return Err(Error::Validation(format!("on/off: tau must be > 0, got {tau}")));
        }
        if signal.bounds.0 < 0.0 || background.bounds.0 < 0.0 {
            return Err(Error::Validation("on/off: yields must be non-negative".into()));
        }
        Ok(Self { tau, params: vec![signal, background] })
    }

    /// On/off scale factor.
    pub fn tau(&self) -> f64 {
        self.tau
    }

    fn means(&self, params: &[f64]) -> (f64, f64) {
        let (s, b) = (params[0], params[1]);
        ((s + b).max(MIN_POISSON_MEAN), (self.tau * b).max(MIN_POISSON_MEAN))
    }

    fn counts(&self, data: &Dataset) -> Result<(u64, u64)> {
        if data.kind() != DatasetKind::NumberCounting || data.n_observables() != 2 {
            return Err(Error::Validation(format!(
                "on/off: expected a number-counting dataset with (x, y), got {:?} with {} observables",
                data.kind(),
                data.n_observables()
            )));
        }
        let e = data.entry(0);
        Ok((poisson::as_count(e[0])?, poisson::as_count(e[1])?))
    }
}

impl ParametricModel for OnOffModel {
    fn name(&self) -> &str {
        "on_off"
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.params
    }

    fn poi_index(&self) -> usize {
        0
    }

    fn observable_names(&self) -> Vec<String> {
        vec!["x".into(), "y".into()]
    }

    fn is_number_counting(&self) -> bool {
        true
    }

    fn can_be_extended(&self) -> bool {
        false
    }

    fn expected_events(&self, _params: &[f64]) -> Result<f64> {
        Err(Error::Validation("on/off: number-counting model has no entry yield".into()))
    }

    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        let (x, y) = self.counts(data)?;
        let (lam_on, lam_off) = self.means(params);
        Ok(poisson::logpmf(x, lam_on)? + poisson::logpmf(y, lam_off)?)
    }

    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        let (x, y) = self.counts(data)?;
        let (lam_on, lam_off) = self.means(params);
        let d_on = 1.0 - x as f64 / lam_on;
        let d_off = self.tau * (1.0 - y as f64 / lam_off);
        Ok(vec![d_on, d_on + d_off])
    }

    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset> {
        draw::require_single_entry(self.name(), policy)?;
        self.check_params(params)?;
        let (s, b) = (params[0], params[1]);
        let x = draw::poisson(s + b, rng)?;
        let y = draw::poisson(self.tau * b, rng)?;
        Dataset::counts(vec![x, y])
    }
}
