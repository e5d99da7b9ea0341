//! Gaussian peak over a flat background on a mass window.

use crate::draw;
use nc_core::{CountPolicy, Dataset, DatasetKind, Error, ParameterSpec, ParametricModel, Result};
use nc_prob::math::{MIN_POISSON_MEAN, ln_factorial};
use nc_prob::normal;
use rand::{Rng, RngCore};

/// Extended mixture `S · Gauss(m | mean, width) + B · Uniform(m)`.
///
/// `S` (signal yield) is the POI and `B` (background yield) the nuisance.
#[derive(Debug, Clone)]
pub struct GaussOverFlatModel {
    range: (f64, f64),
    peak_mean: f64,
    peak_width: f64,
    /// Mass of the untruncated peak inside `range`.
    peak_mass: f64,
    params: Vec<ParameterSpec>,
}

impl GaussOverFlatModel {
    /// Build the mixture on the observable window `range`.
    pub fn new(
        range: (f64, f64),
        peak_mean: f64,
        peak_width: f64,
        signal: ParameterSpec,
        background: ParameterSpec,
    ) -> Result<Self> {
        if !(range.0.is_finite() && range.1.is_finite()) || range.0 >= range.1 {
            return Err(Error::Validation(format!(
                "gauss over flat: invalid window [{}, {}]",
                range.0, range.1
            )));
        }
        if !peak_width.is_finite() || peak_width <= 0.0 {
            return Err(Error::Validation(format!(
                "gauss over flat: peak width must be > 0, got {peak_width}"
            )));
        }
        if signal.bounds.0 < 0.0 || background.bounds.0 < 0.0 {
            return Err(Error::Validation("gauss over flat: yields must be non-negative".into()));
        }
        let peak_mass = normal::cdf((range.1 - peak_mean) / peak_width)
            - normal::cdf((range.0 - peak_mean) / peak_width);
        if peak_mass <= 0.0 {
            return Err(Error::Validation("gauss over flat: peak lies outside the window".into()));
        }
        Ok(Self { range, peak_mean, peak_width, peak_mass, params: vec![signal, background] })
    }

    fn peak_density(&self, x: f64) -> f64 {
        normal::std_pdf((x - self.peak_mean) / self.peak_width) / (self.peak_width * self.peak_mass)
    }

    fn flat_density(&self) -> f64 {
        1.0 / (self.range.1 - self.range.0)
    }

    fn check_data(&self, data: &Dataset) -> Result<()> {
        if data.n_observables() != 1 || data.kind() == DatasetKind::NumberCounting {
            return Err(Error::Validation(
                "gauss over flat: expected an unbinned one-observable dataset".into(),
            ));
        }
        if let Some(x) = data.column(0).find(|x| *x < self.range.0 || *x > self.range.1) {
            return Err(Error::ModelEvaluation(format!(
                "gauss over flat: mass {x} outside [{}, {}]",
                self.range.0, self.range.1
            )));
        }
        Ok(())
    }
}

impl ParametricModel for GaussOverFlatModel {
    fn name(&self) -> &str {
        "gauss_over_flat"
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.params
    }

    fn poi_index(&self) -> usize {
        0
    }

    fn observable_names(&self) -> Vec<String> {
        vec!["mass".into()]
    }

    fn is_number_counting(&self) -> bool {
        false
    }

    fn can_be_extended(&self) -> bool {
        true
    }

    fn expected_events(&self, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        Ok(params[0] + params[1])
    }

    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        self.check_data(data)?;
        let (s, b) = (params[0], params[1]);
        let u = self.flat_density();
        let mut sum_ln = 0.0;
        for x in data.column(0) {
            sum_ln += (s * self.peak_density(x) + b * u).max(MIN_POISSON_MEAN).ln();
        }
        let n = data.n_entries() as f64;
        match data.kind() {
            DatasetKind::Extended => Ok(-(s + b) + sum_ln - ln_factorial(n)),
            _ => {
                let total = s + b;
                if total <= 0.0 {
                    return Err(Error::ModelEvaluation(
                        "gauss over flat: zero total yield for a fixed-count dataset".into(),
                    ));
                }
                Ok(sum_ln - n * total.ln())
            }
        }
    }

    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        self.check_data(data)?;
        let (s, b) = (params[0], params[1]);
        let u = self.flat_density();
        let (mut ds, mut db) = (0.0, 0.0);
        for x in data.column(0) {
            let g = self.peak_density(x);
            let f = (s * g + b * u).max(MIN_POISSON_MEAN);
            ds -= g / f;
            db -= u / f;
        }
        let n = data.n_entries() as f64;
        match data.kind() {
            DatasetKind::Extended => Ok(vec![1.0 + ds, 1.0 + db]),
            _ => {
                let total = (s + b).max(MIN_POISSON_MEAN);
                Ok(vec![ds + n / total, db + n / total])
            }
        }
    }

    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset> {
        let nu = self.expected_events(params)?;
        let n = draw::unbinned_count(self.name(), policy, Some(nu), rng)?;
        if n > 0 && nu <= 0.0 {
            return Err(Error::ModelEvaluation(
                "gauss over flat: cannot draw entries with zero total yield".into(),
            ));
        }
        let signal_fraction = if nu > 0.0 { params[0] / nu } else { 0.0 };
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            let x = if rng.random::<f64>() < signal_fraction {
                draw::truncated_normal(self.peak_mean, self.peak_width, self.range, rng)?
            } else {
                draw::uniform(self.range.0, self.range.1, rng)
            };
            values.push(x);
        }
        let kind = match policy {
            CountPolicy::Extended => DatasetKind::Extended,
            _ => DatasetKind::Fixed,
        };
        Dataset::new(1, values, kind)
    }
}
