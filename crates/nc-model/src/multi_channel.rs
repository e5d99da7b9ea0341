//! Combination of several on/off counting channels.
//!
//! Channel `i` observes `x_i ~ Pois(mu · eff · s_i + b_i)` in its signal region
//! and `y_i ~ Pois(tau_i · b_i)` in its sideband. The signal strength `mu` is
//! shared, each `b_i` is a nuisance of its own, and `s_i` is the signal
//! expected at `mu = 1`. The optional efficiency `eff` scales every channel's
//! signal and carries a Gaussian constraint from an auxiliary measurement.

use crate::draw;
use nc_core::{CountPolicy, Dataset, DatasetKind, Error, ParameterSpec, ParametricModel, Result};
use nc_prob::math::MIN_POISSON_MEAN;
use nc_prob::{normal, poisson};
use rand::RngCore;

/// One on/off channel of a [`MultiChannelOnOffModel`].
#[derive(Debug, Clone)]
pub struct Channel {
    /// Signal expected at unit signal strength.
    pub signal: f64,
    /// Sideband to signal-region background ratio.
    pub tau: f64,
    /// Signal-region background (nuisance).
    pub background: ParameterSpec,
}

/// Gaussian-constrained signal efficiency shared by all channels.
#[derive(Debug, Clone)]
pub struct EfficiencyConstraint {
    /// The efficiency parameter.
    pub parameter: ParameterSpec,
    /// Auxiliary measurement of the efficiency.
    pub nominal: f64,
    /// Its uncertainty.
    pub sigma: f64,
}

/// Product of on/off channels with a common signal strength.
#[derive(Debug, Clone)]
pub struct MultiChannelOnOffModel {
    signal: Vec<f64>,
    tau: Vec<f64>,
    efficiency: Option<(f64, f64)>,
    params: Vec<ParameterSpec>,
}

impl MultiChannelOnOffModel {
    /// Parameters are ordered `mu, b_0 .. b_{n-1}`.
    pub fn new(signal_strength: ParameterSpec, channels: Vec<Channel>) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::Validation("multi-channel on/off: no channels".into()));
        }
        if signal_strength.bounds.0 < 0.0 {
            return Err(Error::Validation(
                "multi-channel on/off: signal strength must be non-negative".into(),
            ));
        }
        let mut params = vec![signal_strength];
        let (mut signal, mut tau) = (Vec::new(), Vec::new());
        for (i, ch) in channels.into_iter().enumerate() {
            if !ch.signal.is_finite() || ch.signal < 0.0 {
                return Err(Error::Validation(format!(
                    "multi-channel on/off: channel {i} signal must be >= 0, got {}",
                    ch.signal
                )));
            }
            if !ch.tau.is_finite() || ch.tau <= 0.0 {
                return Err(Error::Validation(format!(
                    "multi-channel on/off: channel {i} tau must be > 0, got {}",
                    ch.tau
                )));
            }
            if ch.background.bounds.0 < 0.0 {
                return Err(Error::Validation(format!(
                    "multi-channel on/off: channel {i} background must be non-negative"
                )));
            }
            signal.push(ch.signal);
            tau.push(ch.tau);
            params.push(ch.background);
        }
        Ok(Self { signal, tau, efficiency: None, params })
    }

    /// Append a constrained efficiency as the last parameter.
    pub fn with_efficiency(mut self, constraint: EfficiencyConstraint) -> Result<Self> {
        if self.efficiency.is_some() {
            return Err(Error::Validation("multi-channel on/off: efficiency already set".into()));
        }
        if !constraint.sigma.is_finite() || constraint.sigma <= 0.0 {
            return Err(Error::Validation(format!(
                "multi-channel on/off: efficiency sigma must be > 0, got {}",
                constraint.sigma
            )));
        }
        if !constraint.nominal.is_finite() || constraint.parameter.bounds.0 < 0.0 {
            return Err(Error::Validation(
                "multi-channel on/off: efficiency must be non-negative with a finite nominal".into(),
            ));
        }
        self.efficiency = Some((constraint.nominal, constraint.sigma));
        self.params.push(constraint.parameter);
        Ok(self)
    }

    /// Number of channels.
    pub fn n_channels(&self) -> usize {
        self.signal.len()
    }

    fn eff(&self, params: &[f64]) -> f64 {
        if self.efficiency.is_some() { params[self.params.len() - 1] } else { 1.0 }
    }

    /// `(on, off)` means of channel `i`, floored away from zero.
    fn means(&self, params: &[f64], i: usize) -> (f64, f64) {
        let b = params[1 + i];
        let on = params[0] * self.eff(params) * self.signal[i] + b;
        (on.max(MIN_POISSON_MEAN), (self.tau[i] * b).max(MIN_POISSON_MEAN))
    }

    fn counts(&self, data: &Dataset) -> Result<Vec<(u64, u64)>> {
        let n = self.n_channels();
        if data.kind() != DatasetKind::NumberCounting || data.n_observables() != 2 * n {
            return Err(Error::Validation(format!(
                "multi-channel on/off: expected a number-counting dataset with {} observables, \
                 got {:?} with {}",
                2 * n,
                data.kind(),
                data.n_observables()
            )));
        }
        data.entry(0)
            .chunks_exact(2)
            .map(|xy| Ok((poisson::as_count(xy[0])?, poisson::as_count(xy[1])?)))
            .collect()
    }
}

impl ParametricModel for MultiChannelOnOffModel {
    fn name(&self) -> &str {
        "multi_channel_on_off"
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.params
    }

    fn poi_index(&self) -> usize {
        0
    }

    fn observable_names(&self) -> Vec<String> {
        (0..self.n_channels()).flat_map(|i| [format!("x_{i}"), format!("y_{i}")]).collect()
    }

    fn is_number_counting(&self) -> bool {
        true
    }

    fn can_be_extended(&self) -> bool {
        false
    }

    fn expected_events(&self, _params: &[f64]) -> Result<f64> {
        Err(Error::Validation(
            "multi-channel on/off: number-counting model has no entry yield".into(),
        ))
    }

    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        let mut ll = 0.0;
        for (i, (x, y)) in self.counts(data)?.into_iter().enumerate() {
            let (on, off) = self.means(params, i);
            ll += poisson::logpmf(x, on)? + poisson::logpmf(y, off)?;
        }
        if let Some((nominal, sigma)) = self.efficiency {
            ll += normal::logpdf(nominal, self.eff(params), sigma)?;
        }
        Ok(ll)
    }

    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        let (mu, eff) = (params[0], self.eff(params));
        let mut grad = vec![0.0; params.len()];
        let mut d_eff = 0.0;
        for (i, (x, y)) in self.counts(data)?.into_iter().enumerate() {
            let (on, off) = self.means(params, i);
            let d_on = 1.0 - x as f64 / on;
            grad[0] += d_on * eff * self.signal[i];
            grad[1 + i] = d_on + self.tau[i] * (1.0 - y as f64 / off);
            d_eff += d_on * mu * self.signal[i];
        }
        if let Some((nominal, sigma)) = self.efficiency {
            grad[params.len() - 1] = d_eff + (eff - nominal) / (sigma * sigma);
        }
        Ok(grad)
    }

    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset> {
        draw::require_single_entry(self.name(), policy)?;
        self.check_params(params)?;
        let mut counts = Vec::with_capacity(2 * self.n_channels());
        for i in 0..self.n_channels() {
            let b = params[1 + i];
            counts.push(draw::poisson(params[0] * self.eff(params) * self.signal[i] + b, rng)?);
            counts.push(draw::poisson(self.tau[i] * b, rng)?);
        }
        Dataset::counts(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn channel(signal: f64, tau: f64, b: f64) -> Channel {
        Channel {
            signal,
            tau,
            background: ParameterSpec::new("b", b, 0.0, 3.0 * b).unwrap(),
        }
    }

    fn two_channels() -> MultiChannelOnOffModel {
        MultiChannelOnOffModel::new(
            ParameterSpec::new("mu", 1.0, 0.0, 5.0).unwrap(),
            vec![channel(20.0, 100.0, 100.0), channel(10.0, 100.0, 100.0)],
        )
        .unwrap()
    }

    fn with_eff() -> MultiChannelOnOffModel {
        two_channels()
            .with_efficiency(EfficiencyConstraint {
                parameter: ParameterSpec::new("eff", 1.0, 0.0, 2.0).unwrap(),
                nominal: 1.0,
                sigma: 0.2,
            })
            .unwrap()
    }

    fn asimov() -> Dataset {
        Dataset::counts(vec![120.0, 10_000.0, 110.0, 10_000.0]).unwrap()
    }

    #[test]
    fn test_likelihood_is_product_of_channels() {
        let m = two_channels();
        let ll = m.log_likelihood(&asimov(), &[0.5, 90.0, 105.0]).unwrap();
        let expected = poisson::logpmf(120, 100.0).unwrap()
            + poisson::logpmf(10_000, 9_000.0).unwrap()
            + poisson::logpmf(110, 110.0).unwrap()
            + poisson::logpmf(10_000, 10_500.0).unwrap();
        assert_relative_eq!(ll, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_efficiency_scales_signal_and_adds_constraint() {
        let m = with_eff();
        assert_eq!(m.dim(), 4);
        let ll = m.log_likelihood(&asimov(), &[1.0, 100.0, 100.0, 0.5]).unwrap();
        let expected = poisson::logpmf(120, 110.0).unwrap()
            + poisson::logpmf(10_000, 10_000.0).unwrap()
            + poisson::logpmf(110, 105.0).unwrap()
            + poisson::logpmf(10_000, 10_000.0).unwrap()
            + normal::logpdf(1.0, 0.5, 0.2).unwrap();
        assert_relative_eq!(ll, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_analytic_gradient_matches_finite_difference() {
        let m = with_eff();
        let d = Dataset::counts(vec![123.0, 11_123.0, 117.0, 9_876.0]).unwrap();
        let p = [0.8, 104.0, 97.0, 1.1];
        let g = m.grad_nll(&d, &p).unwrap();
        for i in 0..p.len() {
            let h = 1e-5;
            let mut up = p;
            up[i] += h;
            let mut dn = p;
            dn[i] -= h;
            let fd = (m.nll(&d, &up).unwrap() - m.nll(&d, &dn).unwrap()) / (2.0 * h);
            assert_relative_eq!(g[i], fd, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_observables_interleave_channels() {
        let m = two_channels();
        assert_eq!(m.observable_names(), vec!["x_0", "y_0", "x_1", "y_1"]);
        let mut rng = StdRng::seed_from_u64(3);
        let d = m.sample(&[1.0, 100.0, 100.0], CountPolicy::NumberCounting, &mut rng).unwrap();
        assert_eq!(d.n_observables(), 4);
        // sidebands sit near tau * b = 10000
        assert!((d.entry(0)[1] - 10_000.0).abs() < 500.0);
        assert!((d.entry(0)[3] - 10_000.0).abs() < 500.0);
        assert!(m.sample(&[1.0, 100.0, 100.0], CountPolicy::Extended, &mut rng).is_err());
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let mu = ParameterSpec::new("mu", 1.0, 0.0, 5.0).unwrap();
        assert!(MultiChannelOnOffModel::new(mu.clone(), vec![]).is_err());
        assert!(MultiChannelOnOffModel::new(mu.clone(), vec![channel(20.0, 0.0, 100.0)]).is_err());
        assert!(MultiChannelOnOffModel::new(mu, vec![channel(-1.0, 1.0, 100.0)]).is_err());
        let bad_sigma = two_channels().with_efficiency(EfficiencyConstraint {
            parameter: ParameterSpec::new("eff", 1.0, 0.0, 2.0).unwrap(),
            nominal: 1.0,
            sigma: 0.0,
        });
        assert!(bad_sigma.is_err());
    }

    #[test]
    fn test_wrong_dataset_shape_rejected() {
        let m = two_channels();
        let d = Dataset::counts(vec![120.0, 10_000.0]).unwrap();
        assert!(m.log_likelihood(&d, &[1.0, 100.0, 100.0]).is_err());
    }
}
