//! # nc-model
//!
//! Built-in parametric models for toy-based Neyman constructions.
//!
//! - [`OnOffModel`]: signal region plus background control region
//! - [`MultiChannelOnOffModel`]: combination of on/off channels with a shared signal strength
//! - [`PoissonCountModel`]: single count over a known background
//! - [`GaussianMeanModel`]: unbinned Gaussian with unknown mean
//! - [`GaussOverFlatModel`]: extended peak-over-flat mixture
//!
//! Models can also be described declaratively with [`ModelSpec`].

#![warn(missing_docs)]

mod draw;
pub mod gauss_over_flat;
pub mod gaussian;
pub mod multi_channel;
pub mod on_off;
pub mod poisson_count;
pub mod spec;

pub use gauss_over_flat::GaussOverFlatModel;
pub use gaussian::GaussianMeanModel;
pub use multi_channel::{Channel, EfficiencyConstraint, MultiChannelOnOffModel};
pub use on_off::OnOffModel;
pub use poisson_count::PoissonCountModel;
pub use spec::{AnyModel, ChannelSpec, EfficiencySpec, ModelSpec, RangeSpec};
