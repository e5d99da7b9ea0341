//! Frequentist coverage of toy-built intervals.

use nc_core::{CountPolicy, ParameterSpec, ParametricModel};
use nc_inference::{
    AcceptanceSide, BeltConfig, ConfidenceBeltBuilder, Interpolation, IntervalInverter,
    IntervalKind, MaximumLikelihoodEstimator, NuisancePolicy, PlrPolicy, ProfileLikelihoodRatio,
    ToyGenerator, observed_scan,
};
use nc_model::GaussianMeanModel;

const N: usize = 10;
const TRUE_MU: f64 = 0.5;
const N_EXPERIMENTS: u64 = 300;

#[test]
fn test_gaussian_mean_coverage() {
    let m = GaussianMeanModel::new(
        ParameterSpec::new("mu", 0.0, -5.0, 5.0).unwrap(),
        1.0,
        (-50.0, 50.0),
    )
    .unwrap();
    let mle = MaximumLikelihoodEstimator::new();
    let stat = ProfileLikelihoodRatio::new(mle.clone(), PlrPolicy::TwoSided);
    let toys = ToyGenerator::new(CountPolicy::FixedCount(N), 31);

    // [-1.5, 2.5] in steps of 0.1: wide enough for every pseudo-experiment
    let grid: Vec<f64> = (0..=40).map(|i| -1.5 + 0.1 * i as f64).collect();
    let config = BeltConfig {
        confidence_level: 0.95,
        side: AcceptanceSide::Upper,
        nuisance_policy: NuisancePolicy::Nominal,
        n_toys: 500,
        ..BeltConfig::default()
    };
    let belt = ConfidenceBeltBuilder::new(&m, &stat, &mle, &toys)
        .with_config(config)
        .build(&grid, None)
        .unwrap();
    let inverter = IntervalInverter::new(IntervalKind::TwoSided, Interpolation::Linear);

    let truth = m.point(vec![TRUE_MU]).unwrap();
    let experiments = ToyGenerator::new(CountPolicy::FixedCount(N), 9001);
    let mut covered = 0usize;
    for i in 0..N_EXPERIMENTS {
        let data = experiments.generate(&m, &truth, i).unwrap();
        let scan = observed_scan(&m, &stat, &data, &belt).unwrap();
        let ci = inverter.invert(&belt, &scan).unwrap();
        assert!(ci.lower.value <= ci.upper.value, "experiment {i}: {ci:?}");
        if ci.contains(TRUE_MU) {
            covered += 1;
        }
    }

    let coverage = covered as f64 / N_EXPERIMENTS as f64;
    assert!((0.89..=0.99).contains(&coverage), "coverage {coverage}");
}

#[test]
fn test_counting_upper_limit_overcovers() {
    // Discrete counts: the Neyman upper limit covers at least the nominal level.
    use nc_inference::NumEvents;
    use nc_model::PoissonCountModel;

    let m = PoissonCountModel::new(1.0, ParameterSpec::new("mu", 0.0, 0.0, 12.0).unwrap())
        .unwrap();
    let toys = ToyGenerator::new(CountPolicy::NumberCounting, 77);
    let grid: Vec<f64> = (0..=48).map(|i| 0.25 * i as f64).collect();
    let config = BeltConfig {
        confidence_level: 0.9,
        side: AcceptanceSide::Lower,
        nuisance_policy: NuisancePolicy::Nominal,
        n_toys: 4000,
        ..BeltConfig::default()
    };
    let mle = MaximumLikelihoodEstimator::new();
    let belt = ConfidenceBeltBuilder::new(&m, &NumEvents, &mle, &toys)
        .with_config(config)
        .build(&grid, None)
        .unwrap();
    let inverter = IntervalInverter::new(IntervalKind::UpperLimit, Interpolation::None);

    let truth = m.point(vec![3.0]).unwrap();
    let experiments = ToyGenerator::new(CountPolicy::NumberCounting, 1234);
    let n_exp = 2000u64;
    let mut covered = 0usize;
    for i in 0..n_exp {
        let data = experiments.generate(&m, &truth, i).unwrap();
        let ci = inverter.invert_value(&belt, data.entry(0)[0]).unwrap();
        assert_eq!(ci.lower.value, 0.0);
        if ci.contains(3.0) {
            covered += 1;
        }
    }
    let coverage = covered as f64 / n_exp as f64;
    assert!(coverage > 0.87, "coverage {coverage}");
}
