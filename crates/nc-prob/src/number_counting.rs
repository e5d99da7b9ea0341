//! Closed-form significances for single-bin counting experiments.
//!
//! The on/off problem: `n_on ~ Pois(s + b)`, `n_off ~ Pois(tau * b)`. Conditioning
//! on `n_on + n_off` turns the background-only hypothesis into a binomial test whose
//! tail is a regularized incomplete beta function. With a flat prior on `b` the same
//! number is the hybrid (prior-averaged) p-value, which is what toy-based hybrid
//! calculations converge to.

use crate::normal::pvalue_to_significance;
use nc_core::{Error, Result};
use statrs::function::beta::beta_reg;

fn check_positive(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() || v <= 0.0 {
        return Err(Error::Validation(format!("{name} must be finite and > 0, got {v}")));
    }
    Ok(())
}

/// Background-only p-value for `n_obs` on-counts given an off-measurement with
/// expected background `b_exp` in the on-region and on/off ratio `tau`
/// (`n_off = b_exp * tau`).
pub fn binomial_with_tau_obs_p(n_obs: f64, b_exp: f64, tau: f64) -> Result<f64> {
    check_positive("tau", tau)?;
    if !b_exp.is_finite() || b_exp < 0.0 {
        return Err(Error::Validation(format!("b_exp must be finite and >= 0, got {b_exp}")));
    }
    if !n_obs.is_finite() || n_obs < 0.0 {
        return Err(Error::Validation(format!("n_obs must be finite and >= 0, got {n_obs}")));
    }
    if n_obs == 0.0 {
        return Ok(1.0);
    }
    let n_off = b_exp * tau;
    Ok(beta_reg(n_obs, n_off + 1.0, 1.0 / (1.0 + tau)))
}

/// Significance of [`binomial_with_tau_obs_p`].
pub fn binomial_with_tau_obs_z(n_obs: f64, b_exp: f64, tau: f64) -> Result<f64> {
    pvalue_to_significance(binomial_with_tau_obs_p(n_obs, b_exp, tau)?)
}

/// Background-only p-value for `n_obs` when the background `b_exp` has a relative
/// uncertainty `frac_unc`, mapped onto an equivalent off-measurement
/// `tau = 1 / (b_exp * frac_unc²)`.
pub fn binomial_obs_p(n_obs: f64, b_exp: f64, frac_unc: f64) -> Result<f64> {
    check_positive("b_exp", b_exp)?;
    check_positive("frac_unc", frac_unc)?;
    let tau = 1.0 / b_exp / (frac_unc * frac_unc);
    binomial_with_tau_obs_p(n_obs, b_exp, tau)
}

/// Significance of [`binomial_obs_p`].
pub fn binomial_obs_z(n_obs: f64, b_exp: f64, frac_unc: f64) -> Result<f64> {
    pvalue_to_significance(binomial_obs_p(n_obs, b_exp, frac_unc)?)
}

/// Expected p-value when `s_exp + b_exp` events are observed.
pub fn binomial_exp_p(s_exp: f64, b_exp: f64, frac_unc: f64) -> Result<f64> {
    binomial_obs_p(s_exp + b_exp, b_exp, frac_unc)
}

/// Significance of [`binomial_exp_p`].
pub fn binomial_exp_z(s_exp: f64, b_exp: f64, frac_unc: f64) -> Result<f64> {
    pvalue_to_significance(binomial_exp_p(s_exp, b_exp, frac_unc)?)
}
