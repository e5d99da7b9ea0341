//! # nc-core
//!
//! Core types, traits, and error handling shared by the Neyman-construction crates.
//!
//! The central abstraction is [`ParametricModel`]: a probability density over datasets,
//! indexed by a parameter vector, that can also generate toy datasets. Everything the
//! inference layer does (fits, test statistics, belts) is expressed against this trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod traits;
pub mod types;

pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use traits::ParametricModel;
pub use types::{
    CountPolicy, Dataset, DatasetKind, FitResult, ParameterPoint, ParameterSpec,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
