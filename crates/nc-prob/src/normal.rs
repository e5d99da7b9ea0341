//! Normal distribution utilities and p-value ↔ significance conversions.

use nc_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::erf::erfc;

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Log-PDF of a Normal distribution `N(mu, sigma)` at `x`.
///
/// `log p(x) = -0.5 * ((x-mu)/sigma)^2 - ln(sigma) - ln(sqrt(2π))`
pub fn logpdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    let z = (x - mu) / sigma;
    Ok(-0.5 * z * z - sigma.ln() - LN_SQRT_2PI)
}

/// Standard normal density.
pub fn std_pdf(z: f64) -> f64 {
    (-0.5 * z * z - LN_SQRT_2PI).exp()
}

/// Standard normal CDF Φ(z).
pub fn cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// Standard normal upper tail `1 - Φ(z)`, accurate far in the tail.
pub fn sf(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Standard normal quantile Φ⁻¹(p).
pub fn quantile(p: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::Validation(format!("probability must be in [0, 1], got {p}")));
    }
    let n = Normal::new(0.0, 1.0).map_err(|e| Error::Computation(e.to_string()))?;
    Ok(n.inverse_cdf(p))
}

/// One-sided significance `Z = Φ⁻¹(1 - p)`.
pub fn pvalue_to_significance(p: f64) -> Result<f64> {
    Ok(-quantile(p)?)
}

/// One-sided p-value `p = 1 - Φ(Z)`.
pub fn significance_to_pvalue(z: f64) -> f64 {
    sf(z)
}

/// Quantile of χ² with one degree of freedom at probability `cl`.
pub fn chi2_1_quantile(cl: f64) -> Result<f64> {
    let z = quantile(0.5 * (1.0 + cl))?;
    Ok(z * z)
}
