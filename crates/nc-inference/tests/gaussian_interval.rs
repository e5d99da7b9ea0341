//! Gaussian mean with known width: the toy belt reproduces `mean ± 1.96 σ / sqrt(N)`.

use approx::assert_relative_eq;
use nc_core::{CountPolicy, Dataset, ParameterSpec, ParametricModel};
use nc_inference::{
    AcceptanceSide, BeltConfig, ConfidenceBeltBuilder, Interpolation, IntervalInverter,
    IntervalKind, LimitStatus, MaximumLikelihoodEstimator, NuisancePolicy, PlrPolicy,
    ProfileLikelihoodRatio, ToyGenerator, observed_scan, profile_likelihood_interval,
};
use nc_model::GaussianMeanModel;

const N: usize = 100;

fn model() -> GaussianMeanModel {
    GaussianMeanModel::new(ParameterSpec::new("mu", 0.0, -5.0, 5.0).unwrap(), 1.0, (-50.0, 50.0))
        .unwrap()
}

fn observed(m: &GaussianMeanModel) -> (Dataset, f64) {
    let truth = m.point(vec![1.0]).unwrap();
    let data = ToyGenerator::new(CountPolicy::FixedCount(N), 4242).generate(m, &truth, 0).unwrap();
    let mean = data.column(0).sum::<f64>() / N as f64;
    (data, mean)
}

#[test]
fn test_two_sided_interval_matches_wald() {
    let m = model();
    let (data, mean) = observed(&m);
    let mle = MaximumLikelihoodEstimator::new();
    let stat = ProfileLikelihoodRatio::new(mle.clone(), PlrPolicy::TwoSided);
    let toys = ToyGenerator::new(CountPolicy::FixedCount(N), 7);

    // mean ± 0.4 in steps of 0.02
    let grid: Vec<f64> = (0..=40).map(|i| mean - 0.4 + 0.02 * i as f64).collect();
    let config = BeltConfig {
        confidence_level: 0.95,
        side: AcceptanceSide::Upper,
        nuisance_policy: NuisancePolicy::Nominal,
        n_toys: 1000,
        ..BeltConfig::default()
    };
    let belt = ConfidenceBeltBuilder::new(&m, &stat, &mle, &toys)
        .with_config(config)
        .build(&grid, Some(&data))
        .unwrap();
    assert_eq!(belt.len(), 41);
    assert!(!belt.is_partial());

    // thresholds scatter around the chi2(1) quantile
    for p in belt.points() {
        assert!(p.upper > 2.5 && p.upper < 5.5, "threshold {} at {}", p.upper, p.poi);
    }

    let scan = observed_scan(&m, &stat, &data, &belt).unwrap();
    assert!(scan.converged);
    let ci = IntervalInverter::new(IntervalKind::TwoSided, Interpolation::Linear)
        .invert(&belt, &scan)
        .unwrap();

    assert_eq!(ci.lower.status, LimitStatus::Bracketed);
    assert_eq!(ci.upper.status, LimitStatus::Bracketed);
    assert!((ci.lower.value - (mean - 0.196)).abs() < 0.025, "lower {} vs {}", ci.lower.value, mean - 0.196);
    assert!((ci.upper.value - (mean + 0.196)).abs() < 0.025, "upper {} vs {}", ci.upper.value, mean + 0.196);
    assert!(ci.contains(mean));
    assert_relative_eq!(ci.lower.error, 0.01, epsilon = 1e-9);

    let wald = profile_likelihood_interval(&mle, &m, &data, 0.95).unwrap();
    assert_relative_eq!(wald.mu_hat, mean, epsilon = 1e-4);
    assert!((ci.width() - (wald.upper - wald.lower)).abs() < 0.05);
}

#[test]
fn test_mle_statistic_with_central_acceptance() {
    // t = mu_hat; central 90% acceptance gives mean ± 1.645 / 10
    let m = model();
    let (data, mean) = observed(&m);
    let mle = MaximumLikelihoodEstimator::new();
    let stat = nc_inference::MaxLikelihoodEstimate::new(mle.clone());
    let toys = ToyGenerator::new(CountPolicy::FixedCount(N), 8);
    let grid: Vec<f64> = (0..=32).map(|i| mean - 0.32 + 0.02 * i as f64).collect();
    let config = BeltConfig {
        confidence_level: 0.9,
        side: AcceptanceSide::Central,
        nuisance_policy: NuisancePolicy::Nominal,
        n_toys: 1000,
        ..BeltConfig::default()
    };
    let belt = ConfidenceBeltBuilder::new(&m, &stat, &mle, &toys)
        .with_config(config)
        .build(&grid, None)
        .unwrap();
    let scan = observed_scan(&m, &stat, &data, &belt).unwrap();
    let ci = IntervalInverter::new(IntervalKind::TwoSided, Interpolation::Linear)
        .invert(&belt, &scan)
        .unwrap();
    assert!((ci.lower.value - (mean - 0.1645)).abs() < 0.03, "lower {}", ci.lower.value);
    assert!((ci.upper.value - (mean + 0.1645)).abs() < 0.03, "upper {}", ci.upper.value);
}
