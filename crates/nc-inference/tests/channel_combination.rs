//! Two on/off channels combined under a shared signal strength.
//!
//! Channel signals are 20 and 10 at `mu = 1` over backgrounds of 100, each
//! measured in a sideband with `tau = 100` (a 1% background uncertainty).

use approx::assert_relative_eq;
use nc_core::{CountPolicy, Dataset, ParametricModel};
use nc_inference::{
    MaximumLikelihoodEstimator, PlrPolicy, ProfileLikelihoodRatio, ToyGenerator, ToyHypotest,
    discovery_significance, profile_likelihood_interval,
};
use nc_model::{AnyModel, EfficiencySpec, ModelSpec, RangeSpec};

fn load_spec() -> ModelSpec {
    let json = include_str!("../../../tests/fixtures/two_channel_combination.json");
    ModelSpec::from_json_str(json).unwrap()
}

fn load_model() -> AnyModel {
    load_spec().build().unwrap()
}

fn with_efficiency(sigma: f64) -> AnyModel {
    let mut spec = load_spec();
    if let ModelSpec::MultiChannelOnOff { efficiency, .. } = &mut spec {
        *efficiency = Some(EfficiencySpec {
            nominal: 1.0,
            sigma,
            range: RangeSpec { value: 1.0, min: 0.0, max: 2.0, fixed: false },
        });
    }
    spec.build().unwrap()
}

/// Signal and sideband counts at the expectation for `mu = 1`.
fn expected_data() -> Dataset {
    Dataset::counts(vec![120.0, 10_000.0, 110.0, 10_000.0]).unwrap()
}

fn observed_data() -> Dataset {
    Dataset::counts(vec![123.0, 11_123.0, 117.0, 9_876.0]).unwrap()
}

#[test]
fn test_expected_combined_significance() {
    let model = load_model();
    let d = discovery_significance(&MaximumLikelihoodEstimator::new(), &model, &expected_data(), 0.0)
        .unwrap();
    assert_relative_eq!(d.mu_hat, 1.0, epsilon = 1e-2);
    assert_relative_eq!(d.significance, 2.16239, epsilon = 2e-3);
    assert_relative_eq!(d.p_value, 0.015294, epsilon = 2e-4);
}

#[test]
fn test_observed_combined_significance() {
    let model = load_model();
    let d = discovery_significance(&MaximumLikelihoodEstimator::new(), &model, &observed_data(), 0.0)
        .unwrap();
    assert_relative_eq!(d.mu_hat, 0.8727, epsilon = 1e-2);
    assert_relative_eq!(d.significance, 1.80928, epsilon = 2e-3);
    assert_relative_eq!(d.p_value, 0.0352035, epsilon = 3e-4);
}

#[test]
fn test_combination_beats_each_channel() {
    let mle = MaximumLikelihoodEstimator::new();
    let combined = discovery_significance(&mle, &load_model(), &expected_data(), 0.0).unwrap();

    let mut singles = Vec::new();
    for (keep, counts) in [(0, [120.0, 10_000.0]), (1, [110.0, 10_000.0])] {
        let mut spec = load_spec();
        if let ModelSpec::MultiChannelOnOff { channels, .. } = &mut spec {
            let kept = channels[keep];
            *channels = vec![kept];
        }
        let model = spec.build().unwrap();
        let data = Dataset::counts(counts.to_vec()).unwrap();
        singles.push(discovery_significance(&mle, &model, &data, 0.0).unwrap().significance);
    }
    assert_relative_eq!(singles[0], 1.9281, epsilon = 2e-3);
    assert_relative_eq!(singles[1], 0.9789, epsilon = 2e-3);
    assert!(combined.significance > singles[0]);
    // close to the quadrature sum for nearly Gaussian channels
    let quadrature = (singles[0].powi(2) + singles[1].powi(2)).sqrt();
    assert!((combined.significance - quadrature).abs() < 0.05);
}

#[test]
fn test_toy_p_value_agrees_with_asymptotics() {
    let model = load_model();
    let stat =
        ProfileLikelihoodRatio::new(MaximumLikelihoodEstimator::new(), PlrPolicy::OneSidedDiscovery);
    let toys = ToyGenerator::new(CountPolicy::NumberCounting, 77);
    let null = model.nominal_point().unwrap().with_poi(0.0).unwrap();

    let n_toys = 2_000;
    let result = ToyHypotest::new(&model, &stat, &toys).run(&null, &expected_data(), n_toys).unwrap();

    assert_relative_eq!(result.t_observed, 2.16239f64.powi(2), epsilon = 1e-2);
    assert_eq!(result.null_counts.n_requested, n_toys);
    // about three binomial standard errors around the Wilks p-value
    assert!(
        (result.p_value - 0.0153).abs() < 0.009,
        "toy p = {} ± {}",
        result.p_value,
        result.p_value_error
    );
}

#[test]
fn test_efficiency_uncertainty_widens_interval_only() {
    let mle = MaximumLikelihoodEstimator::new();
    let data = expected_data();
    let plain = load_model();
    let constrained = with_efficiency(0.2);

    let a = profile_likelihood_interval(&mle, &plain, &data, 0.68).unwrap();
    let b = profile_likelihood_interval(&mle, &constrained, &data, 0.68).unwrap();
    assert!(b.lower < a.lower, "{} vs {}", b.lower, a.lower);
    assert!(b.upper > a.upper, "{} vs {}", b.upper, a.upper);

    // At mu = 0 the efficiency multiplies nothing, so q0 is unchanged.
    let z_plain = discovery_significance(&mle, &plain, &data, 0.0).unwrap().significance;
    let z_eff = discovery_significance(&mle, &constrained, &data, 0.0).unwrap().significance;
    assert_relative_eq!(z_eff, z_plain, epsilon = 1e-2);
}
