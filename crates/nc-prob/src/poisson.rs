//! Poisson distribution utilities.

use crate::math::ln_factorial;
use nc_core::{Error, Result};
use statrs::function::gamma::gamma_lr;

/// Log-PMF of a Poisson distribution with mean `lambda` at count `k`.
pub fn logpmf(k: u64, lambda: f64) -> Result<f64> {
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(Error::Validation(format!("lambda must be finite and >= 0, got {}", lambda)));
    }
    if lambda == 0.0 {
        return Ok(if k == 0 { 0.0 } else { f64::NEG_INFINITY });
    }

    let kf = k as f64;
    Ok(kf * lambda.ln() - lambda - ln_factorial(kf))
}

/// Interpret a stored observable as a Poisson count.
pub fn as_count(x: f64) -> Result<u64> {
    if !x.is_finite() || x < 0.0 || x.fract() != 0.0 {
        return Err(Error::ModelEvaluation(format!("{x} is not a valid count")));
    }
    Ok(x as u64)
}

/// Upper tail `P(X >= k)` for `X ~ Poisson(lambda)`.
pub fn sf_inclusive(k: u64, lambda: f64) -> Result<f64> {
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(Error::Validation(format!("lambda must be finite and >= 0, got {}", lambda)));
    }
    if k == 0 {
        return Ok(1.0);
    }
    if lambda == 0.0 {
        return Ok(0.0);
    }
    // P(X >= k) = P(k, lambda), the regularized lower incomplete gamma function.
    Ok(gamma_lr(k as f64, lambda))
}
