//! # nc-inference
//!
//! Toy-based frequentist inference.
//!
//! This crate provides:
//! - Maximum likelihood fits (L-BFGS-B) and the usual test statistics
//! - Seeded toy generation, optionally with nuisance priors (hybrid toys)
//! - Parallel sampling distributions and confidence belts
//! - Belt inversion into intervals and expected limit bands
//! - Toy hypothesis tests and asymptotic cross-checks
//! - [`NeymanAnalysis`], which drives a full run from an [`AnalysisConfig`]
//!
//! ## Architecture
//!
//! Everything here is written against the `ParametricModel` trait from nc-core;
//! concrete likelihoods live in nc-model or in user code.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Run driver and phase state machine.
pub mod analysis;
/// Asymptotic (Wilks) intervals and significances.
pub mod asymptotic;
/// Expected limit bands.
pub mod bands;
/// Confidence belt construction.
pub mod belt;
/// Analysis configuration.
pub mod config;
/// Toy-based hypothesis tests.
pub mod hypotest;
/// Belt inversion.
pub mod interval;
/// Maximum-likelihood estimation via L-BFGS-B.
pub mod mle;
/// Bounded NLL minimization (projected L-BFGS).
pub mod optimizer;
/// Sampling distributions of test statistics.
pub mod sampling;
/// Test statistics.
pub mod test_statistic;
/// Toy dataset generation.
pub mod toys;

pub use analysis::{AnalysisPhase, AnalysisReport, NeymanAnalysis, RunDiagnostics};
pub use asymptotic::{
    DiscoverySignificance, ProfileLikelihoodInterval, discovery_significance,
    profile_likelihood_interval,
};
pub use bands::{BAND_SIGMAS, ClbValues, ExpectedBand, ExpectedBandBuilder};
pub use belt::{BeltConfig, BeltPoint, ConfidenceBelt, ConfidenceBeltBuilder, NuisancePolicy};
pub use config::{AnalysisConfig, ScanConfig, uniform_grid};
pub use hypotest::{ToyHypotest, ToyHypotestResult};
pub use interval::{
    ConfidenceInterval, Interpolation, IntervalInverter, IntervalKind, Limit, LimitStatus,
    ObservedScan, observed_scan,
};
pub use mle::MaximumLikelihoodEstimator;
pub use optimizer::{BoundedLbfgs, FitMinimum, FitProblem, OptimizerConfig};
pub use sampling::{
    AcceptanceSide, SamplingDistribution, SamplingDistributionBuilder, TailTarget, ToyCounts,
    ToySample,
};
pub use test_statistic::{
    MaxLikelihoodEstimate, NumEvents, PlrPolicy, ProfileLikelihoodRatio,
    RatioOfProfiledLikelihoods, SimpleLikelihoodRatio, TestStatistic, TestStatisticConfig,
    TestStatisticValue,
};
pub use toys::{NuisancePrior, ToyGenerator};
