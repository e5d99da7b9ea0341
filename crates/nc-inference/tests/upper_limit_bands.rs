//! Poisson signal over a known background: upper limits, expected bands, and
//! the run state machine, driven from the JSON fixtures.

use nc_core::{CancellationToken, Dataset, ParametricModel};
use nc_inference::{
    AcceptanceSide, AnalysisConfig, AnalysisPhase, IntervalKind, LimitStatus, NeymanAnalysis,
    NumEvents, ScanConfig, TestStatisticConfig, observed_scan,
};
use nc_model::{AnyModel, ModelSpec};

fn load_model() -> AnyModel {
    let json = include_str!("../../../tests/fixtures/poisson_count_model.json");
    ModelSpec::from_json_str(json).unwrap().build().unwrap()
}

fn load_config() -> AnalysisConfig {
    let json = include_str!("../../../tests/fixtures/upper_limit_analysis.json");
    AnalysisConfig::from_json_str(json).unwrap()
}

fn observed() -> Dataset {
    Dataset::counts(vec![3.0]).unwrap()
}

#[test]
fn test_fixture_parses() {
    let cfg = load_config();
    cfg.validate().unwrap();
    assert_eq!(cfg.interval, IntervalKind::UpperLimit);
    assert_eq!(cfg.n_toys_per_point, 500);
    assert_eq!(cfg.scan.grid(load_model().poi_bounds()).len(), 31);
    assert_eq!(cfg.seed, Some(20240611));
}

#[test]
fn test_upper_limit_with_bands() {
    let model = load_model();
    let data = observed();
    let report = NeymanAnalysis::new(&model, &data, load_config()).run(&CancellationToken::new());
    assert!(report.is_done(), "{}", report.summary());
    assert_eq!(report.transitions.last(), Some(&AnalysisPhase::Done));
    assert!(!report.partial && !report.cancelled);

    let ci = report.interval.unwrap();
    assert_eq!(ci.lower.value, 0.0);
    assert_eq!(ci.lower.status, LimitStatus::NaturalBoundary);
    assert_eq!(ci.upper.status, LimitStatus::Bracketed);
    assert!(ci.lower.value <= ci.upper.value);
    // observed = background: the 90% limit is a few events
    assert!(ci.upper.value > 1.5 && ci.upper.value < 7.0, "UL {}", ci.upper.value);

    let band = report.band.unwrap();
    let q = band.quantiles();
    for w in q.windows(2) {
        assert!(w[0] <= w[1], "band not ordered: {q:?}");
    }
    assert_eq!(band.n_requested, 100);
    assert!(band.limits.len() + band.n_failed + band.n_open >= 1);
    let clb = band.clb.unwrap();
    assert!(clb.strict <= clb.inclusive);
    assert!(band.observed_sigma(ci.upper.value).abs() < 3.0);
}

#[test]
fn test_inversion_is_idempotent() {
    let model = load_model();
    let data = observed();
    let cfg = load_config();
    let inverter = cfg.inverter();
    let report = NeymanAnalysis::new(&model, &data, AnalysisConfig { n_toy_mc: 0, ..cfg })
        .run(&CancellationToken::new());
    let belt = report.belt.unwrap();
    let scan = report.observed_scan.unwrap();

    let stat = load_config()
        .test_statistic
        .build(&model, &nc_inference::MaximumLikelihoodEstimator::new())
        .unwrap();
    let rescan = observed_scan(&model, stat.as_ref(), &data, &belt).unwrap();
    assert_eq!(rescan, scan);

    let a = inverter.invert(&belt, &scan).unwrap();
    let b = inverter.invert(&belt, &scan).unwrap();
    assert_eq!(a, b);
    assert_eq!(Some(a), report.interval);
}

#[test]
fn test_threshold_itself_is_accepted() {
    let model = load_model();
    let data = observed();
    let cfg = AnalysisConfig { n_toy_mc: 0, ..load_config() };
    let report = NeymanAnalysis::new(&model, &data, cfg).run(&CancellationToken::new());
    let belt = report.belt.unwrap();
    for p in belt.points() {
        assert!(p.accepts(p.upper), "POI {}: t = threshold rejected", p.poi);
        assert_eq!(p.margin(p.upper), 0.0);
        assert!(!p.accepts(p.upper + 1e-9));
    }
}

#[test]
fn test_number_of_events_limit_matches_classical() {
    // Classical 90% limit on s for n = 3, b = 3 is 6.68 - 3 = 3.68.
    let model = load_model();
    let data = observed();
    let cfg = AnalysisConfig {
        n_toys_per_point: 2000,
        scan: ScanConfig::Uniform { points: 33, min: Some(0.0), max: Some(8.0) },
        acceptance: AcceptanceSide::Lower,
        test_statistic: TestStatisticConfig::NumEvents,
        n_toy_mc: 0,
        ..load_config()
    };
    let report = NeymanAnalysis::new(&model, &data, cfg)
        .with_test_statistic(Box::new(NumEvents))
        .run(&CancellationToken::new());
    assert!(report.is_done(), "{}", report.summary());
    let ul = report.interval.unwrap().upper;
    assert!((ul.value - 3.68).abs() < 0.8, "UL {}", ul.value);
    assert!((ul.error - 0.125).abs() < 1e-9);
}

#[test]
fn test_cancelled_run_reports_partial() {
    let model = load_model();
    let data = observed();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = NeymanAnalysis::new(&model, &data, load_config()).run(&cancel);
    assert!(report.cancelled);
    assert!(report.partial);
    assert_ne!(report.phase, AnalysisPhase::Done);
    assert!(report.failure.is_none());
}

#[test]
fn test_failure_keeps_belt() {
    // A reference point outside the POI range fails band building only.
    let model = load_model();
    let data = observed();
    let cfg = AnalysisConfig { reference_poi: Some(-1.0), ..load_config() };
    let report = NeymanAnalysis::new(&model, &data, cfg).run(&CancellationToken::new());
    assert_eq!(report.phase, AnalysisPhase::Failed);
    assert!(report.failure.is_some());
    assert_eq!(report.belt.map(|b| b.len()), Some(31));
    assert!(report.interval.is_some());
}
