//! Asymptotic (Wilks) cross-checks for the toy-based results.

use crate::mle::MaximumLikelihoodEstimator;
use nc_core::{Dataset, Error, ParametricModel, Result};
use nc_prob::normal;
use serde::{Deserialize, Serialize};

/// Profile likelihood interval from `2 ΔNLL <= χ²₁(CL)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileLikelihoodInterval {
    /// Unconditional best-fit POI value.
    pub mu_hat: f64,
    /// Lower limit.
    pub lower: f64,
    /// Upper limit.
    pub upper: f64,
    /// The lower limit is the POI's range minimum.
    pub lower_at_boundary: bool,
    /// The upper limit is the POI's range maximum.
    pub upper_at_boundary: bool,
    /// Confidence level.
    pub confidence_level: f64,
    /// `2 ΔNLL` threshold.
    pub threshold: f64,
}

/// Asymptotic discovery significance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySignificance {
    /// `q0 = 2 (NLL(null) - NLL(free))`, zero when `mu_hat < null`.
    pub q0: f64,
    /// `sqrt(q0)`.
    pub significance: f64,
    /// `Φ(-Z)`.
    pub p_value: f64,
    /// Best-fit POI value.
    pub mu_hat: f64,
}

const BISECTION_ITERS: usize = 80;

/// Profile likelihood interval for the POI at confidence level `cl`.
pub fn profile_likelihood_interval(
    mle: &MaximumLikelihoodEstimator,
    model: &dyn ParametricModel,
    data: &Dataset,
    cl: f64,
) -> Result<ProfileLikelihoodInterval> {
    if !(cl > 0.0 && cl < 1.0) {
        return Err(Error::Validation(format!("confidence level must be in (0, 1), got {cl}")));
    }
    let threshold = normal::chi2_1_quantile(cl)?;
    let free = mle.fit_minimum(model, data)?;
    if !free.converged {
        log::warn!("profile likelihood: free fit did not converge: {}", free.message);
    }
    let poi = model.poi_index();
    let mu_hat = free.parameters[poi];
    let (lo, hi) = model.poi_bounds();

    // f(mu) = 2 ΔNLL(mu) - threshold; negative inside the interval.
    let excess = |mu: f64| -> Result<f64> {
        let cond = mle.fit_conditional(model, data, mu, Some(&free.parameters))?;
        Ok(2.0 * (cond.nll - free.nll).max(0.0) - threshold)
    };

    let bisect = |inside: f64, outside: f64| -> Result<f64> {
        let (mut a, mut b) = (inside, outside);
        let tol = 1e-7 * (1.0 + inside.abs().max(outside.abs()));
        for _ in 0..BISECTION_ITERS {
            if (b - a).abs() <= tol {
                break;
            }
            let mid = 0.5 * (a + b);
            if excess(mid)? <= 0.0 {
                a = mid;
            } else {
                b = mid;
            }
        }
        Ok(0.5 * (a + b))
    };

    let lower_at_boundary = excess(lo)? <= 0.0;
    let lower = if lower_at_boundary { lo } else { bisect(mu_hat, lo)? };
    let upper_at_boundary = excess(hi)? <= 0.0;
    let upper = if upper_at_boundary { hi } else { bisect(mu_hat, hi)? };

    Ok(ProfileLikelihoodInterval {
        mu_hat,
        lower,
        upper,
        lower_at_boundary,
        upper_at_boundary,
        confidence_level: cl,
        threshold,
    })
}

/// Asymptotic significance of an excess over `null_poi`.
pub fn discovery_significance(
    mle: &MaximumLikelihoodEstimator,
    model: &dyn ParametricModel,
    data: &Dataset,
    null_poi: f64,
) -> Result<DiscoverySignificance> {
    let free = mle.fit_minimum(model, data)?;
    let mu_hat = free.parameters[model.poi_index()];
    let cond = mle.fit_conditional(model, data, null_poi, Some(&free.parameters))?;
    let q0 = if mu_hat < null_poi { 0.0 } else { (2.0 * (cond.nll - free.nll)).max(0.0) };
    let significance = q0.sqrt();
    Ok(DiscoverySignificance {
        q0,
        significance,
        p_value: normal::significance_to_pvalue(significance),
        mu_hat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nc_core::{DatasetKind, ParameterSpec};
    use nc_model::{GaussianMeanModel, OnOffModel};

    #[test]
    fn test_gaussian_interval_is_wald() {
        let model = GaussianMeanModel::new(
            ParameterSpec::new("mu", 0.0, -5.0, 5.0).unwrap(),
            1.0,
            (-50.0, 50.0),
        )
        .unwrap();
        let xs: Vec<f64> = (0..100).map(|i| ((i * 37) % 100) as f64 / 50.0 - 1.0).collect();
        let mean = xs.iter().sum::<f64>() / 100.0;
        let data = Dataset::new(1, xs, DatasetKind::Fixed).unwrap();
        let pl = profile_likelihood_interval(&MaximumLikelihoodEstimator::new(), &model, &data, 0.95)
            .unwrap();
        assert_relative_eq!(pl.mu_hat, mean, epsilon = 1e-4);
        assert_relative_eq!(pl.lower, mean - 0.196, epsilon = 2e-3);
        assert_relative_eq!(pl.upper, mean + 0.196, epsilon = 2e-3);
        assert!(!pl.lower_at_boundary && !pl.upper_at_boundary);
    }

    #[test]
    fn test_on_off_discovery() {
        let model = OnOffModel::new(
            1.0,
            ParameterSpec::new("s", 0.0, 0.0, 100.0).unwrap(),
            ParameterSpec::new("b", 100.0, 0.0, 300.0).unwrap(),
        )
        .unwrap();
        let data = Dataset::counts(vec![150.0, 100.0]).unwrap();
        let d = discovery_significance(&MaximumLikelihoodEstimator::new(), &model, &data, 0.0)
            .unwrap();
        let q0 = 2.0 * (150.0 * (1.2f64).ln() + 100.0 * (0.8f64).ln());
        assert_relative_eq!(d.q0, q0, epsilon = 1e-4);
        assert_relative_eq!(d.significance, q0.sqrt(), epsilon = 1e-4);
        assert!(d.p_value < 1e-3);
    }

    #[test]
    fn test_interval_clipped_at_boundary() {
        let model = OnOffModel::new(
            1.0,
            ParameterSpec::new("s", 0.0, 0.0, 100.0).unwrap(),
            ParameterSpec::new("b", 100.0, 0.0, 300.0).unwrap(),
        )
        .unwrap();
        let data = Dataset::counts(vec![95.0, 100.0]).unwrap();
        let pl = profile_likelihood_interval(&MaximumLikelihoodEstimator::new(), &model, &data, 0.68)
            .unwrap();
        assert!(pl.lower_at_boundary);
        assert_eq!(pl.lower, 0.0);
        assert!(pl.upper > 0.0 && pl.upper < 30.0);
    }
}
