//! Probability building blocks for the Neyman-construction crates.
//!
//! - log-space Poisson and Normal helpers used by the model likelihoods
//! - p-value ↔ significance conversions
//! - closed-form number-counting significances (on/off problem)

pub mod math;
pub mod normal;
pub mod number_counting;
pub mod poisson;
