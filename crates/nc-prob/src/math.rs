//! Shared numeric constants and helpers for the likelihoods.

use statrs::function::gamma::ln_gamma;

/// Smallest Poisson mean used when a model predicts a zero yield.
///
/// Keeps `ln(lambda)` finite so line searches near `s + b = 0` do not see `-inf`.
pub const MIN_POISSON_MEAN: f64 = 1e-12;

/// `ln(n!)` via `ln Γ(n + 1)`.
#[inline]
pub fn ln_factorial(n: f64) -> f64 {
    ln_gamma(n + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ln_factorial_small_values() {
        assert!(ln_factorial(0.0).abs() < 1e-12);
        assert!((ln_factorial(5.0) - 120f64.ln()).abs() < 1e-10);
    }
}
