//! Unbinned Gaussian with unknown mean and known width.

use crate::draw;
use nc_core::{CountPolicy, Dataset, DatasetKind, Error, ParameterSpec, ParametricModel, Result};
use nc_prob::{normal, poisson};
use rand::RngCore;

/// `x ~ N(mu, sigma)` truncated to the observable range.
#[derive(Debug, Clone)]
pub struct GaussianMeanModel {
    sigma: f64,
    range: (f64, f64),
    expected_events: Option<f64>,
    params: Vec<ParameterSpec>,
}

impl GaussianMeanModel {
    /// `mean` is the POI; `range` the observable window.
    pub fn new(mean: ParameterSpec, sigma: f64, range: (f64, f64)) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(Error::Validation(format!("gaussian: sigma must be > 0, got {sigma}")));
        }
        if !(range.0.is_finite() && range.1.is_finite()) || range.0 >= range.1 {
            return Err(Error::Validation(format!(
                "gaussian: invalid observable range [{}, {}]",
                range.0, range.1
            )));
        }
        Ok(Self { sigma, range, expected_events: None, params: vec![mean] })
    }

    /// Expected number of entries, enabling [`CountPolicy::Extended`] generation.
    pub fn with_expected_events(mut self, nu: f64) -> Result<Self> {
        if !nu.is_finite() || nu <= 0.0 {
            return Err(Error::Validation(format!("gaussian: expected events must be > 0, got {nu}")));
        }
        self.expected_events = Some(nu);
        Ok(self)
    }

    /// Known width.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Probability mass of `N(mu, sigma)` inside the observable range and its
    /// derivative with respect to `mu`.
    fn norm_and_deriv(&self, mu: f64) -> (f64, f64) {
        let z_lo = (self.range.0 - mu) / self.sigma;
        let z_hi = (self.range.1 - mu) / self.sigma;
        let mass = normal::cdf(z_hi) - normal::cdf(z_lo);
        let d_mass = (normal::std_pdf(z_lo) - normal::std_pdf(z_hi)) / self.sigma;
        (mass, d_mass)
    }

    fn check_data(&self, data: &Dataset) -> Result<()> {
        if data.n_observables() != 1 || data.kind() == DatasetKind::NumberCounting {
            return Err(Error::Validation(
                "gaussian: expected an unbinned one-observable dataset".into(),
            ));
        }
        if let Some(x) = data.column(0).find(|x| *x < self.range.0 || *x > self.range.1) {
            return Err(Error::ModelEvaluation(format!(
                "gaussian: x = {x} outside [{}, {}]",
                self.range.0, self.range.1
            )));
        }
        Ok(())
    }
}

impl ParametricModel for GaussianMeanModel {
    fn name(&self) -> &str {
        "gaussian_mean"
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
        false
    }

    fn can_be_extended(&self) -> bool {
        self.expected_events.is_some()
    }

    fn expected_events(&self, _params: &[f64]) -> Result<f64> {
        self.expected_events
            .ok_or_else(|| Error::Validation("gaussian: no expected yield configured".into()))
    }

    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        self.check_data(data)?;
        let mu = params[0];
        let (mass, _) = self.norm_and_deriv(mu);
        if mass <= 0.0 {
            return Err(Error::ModelEvaluation(format!(
                "gaussian: no probability mass in the observable range at mu = {mu}"
            )));
        }
        let n = data.n_entries() as f64;
        let mut ll = -n * mass.ln();
        for x in data.column(0) {
            ll += normal::logpdf(x, mu, self.sigma)?;
        }
        if data.kind() == DatasetKind::Extended {
            let nu = self.expected_events(params)?;
            ll += poisson::logpmf(data.n_entries() as u64, nu)?;
        }
        Ok(ll)
    }

    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        self.check_data(data)?;
        let mu = params[0];
        let (mass, d_mass) = self.norm_and_deriv(mu);
        if mass <= 0.0 {
            return Err(Error::ModelEvaluation(format!(
                "gaussian: no probability mass in the observable range at mu = {mu}"
            )));
        }
        let s2 = self.sigma * self.sigma;
        let pull: f64 = data.column(0).map(|x| (x - mu) / s2).sum();
        Ok(vec![-pull + data.n_entries() as f64 * d_mass / mass])
    }

    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset> {
        self.check_params(params)?;
        let n = draw::unbinned_count(self.name(), policy, self.expected_events, rng)?;
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(draw::truncated_normal(params[0], self.sigma, self.range, rng)?);
        }
        let kind = match policy {
            CountPolicy::Extended => DatasetKind::Extended,
            _ => DatasetKind::Fixed,
        };
        Dataset::new(1, values, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model() -> GaussianMeanModel {
        GaussianMeanModel::new(ParameterSpec::new("mu", 0.0, -1.0, 1.0).unwrap(), 1.0, (-10.0, 10.0))
            .unwrap()
    }

    #[test]
    fn test_fixed_count_toys() {
        let m = model();
        let mut rng = StdRng::seed_from_u64(3001);
        let d = m.sample(&[0.2], CountPolicy::FixedCount(100), &mut rng).unwrap();
        assert_eq!(d.n_entries(), 100);
        assert_eq!(d.kind(), DatasetKind::Fixed);
        assert!(d.column(0).all(|x| (-10.0..=10.0).contains(&x)));
    }

    #[test]
    fn test_extended_requires_yield() {
        let m = model();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(m.sample(&[0.0], CountPolicy::Extended, &mut rng).is_err());

        let m = model().with_expected_events(50.0).unwrap();
        let n_toys = 400;
        let mean: f64 = (0..n_toys)
            .map(|_| m.sample(&[0.0], CountPolicy::Extended, &mut rng).unwrap().n_entries() as f64)
            .sum::<f64>()
            / n_toys as f64;
        // sd of the mean ≈ 0.35
        assert!((mean - 50.0).abs() < 1.5, "mean={mean}");
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        // Narrow window so the normalisation term matters.
        let m = GaussianMeanModel::new(
            ParameterSpec::new("mu", 0.0, -2.0, 2.0).unwrap(),
            1.0,
            (-1.0, 1.5),
        )
        .unwrap();
        let d = Dataset::new(1, vec![-0.3, 0.1, 0.9, 1.2], DatasetKind::Fixed).unwrap();
        let mu = 0.4;
        let g = m.grad_nll(&d, &[mu]).unwrap()[0];
        let h = 1e-6;
        let fd = (m.nll(&d, &[mu + h]).unwrap() - m.nll(&d, &[mu - h]).unwrap()) / (2.0 * h);
        assert_relative_eq!(g, fd, epsilon = 1e-6);
    }

    #[test]
    fn test_entry_outside_range_is_recoverable() {
        let m = model();
        let d = Dataset::new(1, vec![11.0], DatasetKind::Fixed).unwrap();
        assert!(m.log_likelihood(&d, &[0.0]).unwrap_err().is_recoverable());
    }
}
