//! End-to-end Neyman construction.
//!
//! [`NeymanAnalysis::run`] walks the phases
//! `Idle → BeltBuilding → BeltReady → ObservedInversion → IntervalReady →
//! [ExpectedBandBuilding →] Done`. Any systemic error moves the run to `Failed`;
//! whatever was computed before stays in the report. Cancellation stops at the
//! phase reached so far and tags the report partial.

use crate::bands::{ExpectedBand, ExpectedBandBuilder};
use crate::belt::{ConfidenceBelt, ConfidenceBeltBuilder, NuisancePolicy};
use crate::config::{AnalysisConfig, uniform_grid};
use crate::interval::{ConfidenceInterval, IntervalKind, LimitStatus, ObservedScan, observed_scan};
use crate::mle::MaximumLikelihoodEstimator;
use crate::sampling::ToyCounts;
use crate::test_statistic::TestStatistic;
use crate::toys::ToyGenerator;
use nc_core::{CancellationToken, Dataset, Error, ParameterPoint, ParametricModel, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Phase of an analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    /// Not started.
    Idle,
    /// Sampling distributions are being built.
    BeltBuilding,
    /// The belt is complete.
    BeltReady,
    /// The observed data are being scanned and inverted.
    ObservedInversion,
    /// The observed interval is available.
    IntervalReady,
    /// Background-only toys are being inverted.
    ExpectedBandBuilding,
    /// Finished.
    Done,
    /// Stopped by a systemic error.
    Failed,
}

impl AnalysisPhase {
    /// Whether `next` may follow `self`.
    ///
    /// `IntervalReady → BeltBuilding` is the auto-scan refinement loop.
    pub fn can_advance_to(self, next: AnalysisPhase) -> bool {
        use AnalysisPhase::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, BeltBuilding)
            | (BeltBuilding, BeltReady)
            | (BeltReady, ObservedInversion)
            | (ObservedInversion, IntervalReady)
            | (IntervalReady, BeltBuilding)
            | (IntervalReady, ExpectedBandBuilding)
            | (IntervalReady, Done)
            | (ExpectedBandBuilding, Done) => true,
            _ => false,
        }
    }

    /// `Done` or `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisPhase::Done | AnalysisPhase::Failed)
    }
}

/// Aggregated failure and reliability counts of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Base seed of the toy streams.
    pub seed: u64,
    /// Toy counts summed over every belt point.
    pub belt_toys: ToyCounts,
    /// Scan points in the belt.
    pub n_scan_points: usize,
    /// Scan points dropped for lack of valid toys.
    pub n_failed_points: usize,
    /// Points with fewer valid toys than requested.
    pub n_low_confidence_points: usize,
    /// Points whose non-convergence exceeded the threshold.
    pub n_unreliable_points: usize,
    /// Observed-scan points whose evaluation failed.
    pub n_observed_failures: usize,
    /// Every observed fit converged.
    pub observed_converged: bool,
    /// Auto-scan refinement rounds performed.
    pub n_refinements: usize,
    /// Band toys requested.
    pub band_toys_requested: usize,
    /// Band toys without a usable limit.
    pub band_toys_failed: usize,
    /// Band toy limits open at the scan edge.
    pub band_toys_open: usize,
    /// Band toys not run because of cancellation.
    pub band_toys_skipped: usize,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Last phase reached.
    pub phase: AnalysisPhase,
    /// Phases visited, in order.
    pub transitions: Vec<AnalysisPhase>,
    /// Model name.
    pub model: String,
    /// Test statistic name.
    pub statistic: String,
    /// Confidence level.
    pub confidence_level: f64,
    /// The belt, once built.
    pub belt: Option<ConfidenceBelt>,
    /// Observed statistic along the belt grid.
    pub observed_scan: Option<ObservedScan>,
    /// Observed interval.
    pub interval: Option<ConfidenceInterval>,
    /// Expected band.
    pub band: Option<ExpectedBand>,
    /// Failure and reliability counts.
    pub diagnostics: RunDiagnostics,
    /// Error that moved the run to `Failed`.
    pub failure: Option<String>,
    /// Some result was computed from incomplete ensembles.
    pub partial: bool,
    /// Cancellation was requested during the run.
    pub cancelled: bool,
}

impl AnalysisReport {
    fn new(model: &str, confidence_level: f64) -> Self {
        Self {
            phase: AnalysisPhase::Idle,
            transitions: vec![AnalysisPhase::Idle],
            model: model.to_string(),
            statistic: String::new(),
            confidence_level,
            belt: None,
            observed_scan: None,
            interval: None,
            band: None,
            diagnostics: RunDiagnostics::default(),
            failure: None,
            partial: false,
            cancelled: false,
        }
    }

    fn advance(&mut self, next: AnalysisPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::Computation(format!(
                "invalid phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        log::info!("analysis phase: {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.transitions.push(next);
        Ok(())
    }

    fn fail(&mut self, err: &Error) {
        log::warn!("analysis failed in phase {:?}: {err}", self.phase);
        self.failure = Some(err.to_string());
        if self.phase.can_advance_to(AnalysisPhase::Failed) {
            self.phase = AnalysisPhase::Failed;
            self.transitions.push(AnalysisPhase::Failed);
        }
    }

    /// Finished without error.
    pub fn is_done(&self) -> bool {
        self.phase == AnalysisPhase::Done
    }

    /// Human-readable summary; always lists failure counts.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "model: {}, statistic: {}", self.model, self.statistic);
        let _ = writeln!(s, "phase: {:?}", self.phase);
        if let Some(ci) = &self.interval {
            let _ = writeln!(
                s,
                "{:.1}% CL interval: [{:.6}, {:.6}] (lower {:?} ± {:.3e}, upper {:?} ± {:.3e})",
                100.0 * ci.confidence_level,
                ci.lower.value,
                ci.upper.value,
                ci.lower.status,
                ci.lower.error,
                ci.upper.status,
                ci.upper.error
            );
        }
        if let Some(b) = &self.band {
            let _ = writeln!(
                s,
                "expected: median {:.6}, ±1σ [{:.6}, {:.6}], ±2σ [{:.6}, {:.6}]",
                b.median, b.minus_one, b.plus_one, b.minus_two, b.plus_two
            );
        }
        let d = &self.diagnostics;
        let t = &d.belt_toys;
        let _ = writeln!(
            s,
            "scan points: {} built, {} failed, {} low-confidence, {} unreliable, {} refinements",
            d.n_scan_points,
            d.n_failed_points,
            d.n_low_confidence_points,
            d.n_unreliable_points,
            d.n_refinements
        );
        let _ = writeln!(
            s,
            "belt toys: {} requested, {} valid, {} failed ({} model errors, {} fit failures, {} non-finite), {} non-converged, {} skipped",
            t.n_requested,
            t.n_valid,
            t.n_failed(),
            t.n_model_errors,
            t.n_fit_failures,
            t.n_nonfinite,
            t.n_nonconverged,
            t.n_skipped
        );
        let _ = writeln!(
            s,
            "observed scan: {} failed points, converged: {}",
            d.n_observed_failures, d.observed_converged
        );
        if d.band_toys_requested > 0 {
            let _ = writeln!(
                s,
                "band toys: {} requested, {} failed, {} open at scan edge, {} skipped",
                d.band_toys_requested, d.band_toys_failed, d.band_toys_open, d.band_toys_skipped
            );
        }
        if self.cancelled {
            let _ = writeln!(s, "cancelled: results are partial");
        } else if self.partial {
            let _ = writeln!(s, "results are partial");
        }
        if let Some(f) = &self.failure {
            let _ = writeln!(s, "failure: {f}");
        }
        s
    }
}

/// A full toy-based Neyman construction on one observed dataset.
pub struct NeymanAnalysis<'a> {
    model: &'a dyn ParametricModel,
    observed: &'a Dataset,
    config: AnalysisConfig,
    test_stat: Option<Box<dyn TestStatistic>>,
}

impl<'a> NeymanAnalysis<'a> {
    /// Analysis of `observed` under `model`.
    pub fn new(model: &'a dyn ParametricModel, observed: &'a Dataset, config: AnalysisConfig) -> Self {
        Self { model, observed, config, test_stat: None }
    }

    /// Use `stat` instead of the configured test statistic.
    pub fn with_test_statistic(mut self, stat: Box<dyn TestStatistic>) -> Self {
        self.test_stat = Some(stat);
        self
    }

    /// Settings.
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run to completion, failure, or cancellation.
    pub fn run(&self, cancel: &CancellationToken) -> AnalysisReport {
        let mut report = AnalysisReport::new(self.model.name(), self.config.confidence_level);
        let outcome = match self.config.threads {
            Some(n) => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => pool.install(|| self.execute(cancel, &mut report)),
                Err(e) => Err(Error::Computation(format!("thread pool: {e}"))),
            },
            None => self.execute(cancel, &mut report),
        };
        if let Err(e) = outcome {
            report.fail(&e);
        }
        report.cancelled |= cancel.is_cancelled();
        report.partial = report.cancelled
            || report.belt.as_ref().is_some_and(|b| b.is_partial())
            || report.band.as_ref().is_some_and(|b| b.partial);
        self.fill_diagnostics(&mut report);
        report
    }

    fn toy_generator(&self) -> Result<ToyGenerator> {
        let policy = self.config.resolve_count_policy(self.model, self.observed);
        let mut toys = ToyGenerator::from_optional_seed(policy, self.config.seed);
        let names = self.model.parameter_names();
        for (name, prior) in &self.config.nuisance_priors {
            let idx = names.iter().position(|n| n == name).ok_or_else(|| {
                Error::Validation(format!("prior on unknown parameter '{name}'"))
            })?;
            toys = toys.with_prior(idx, *prior)?;
        }
        toys.validate_for(self.model)?;
        Ok(toys)
    }

    fn execute(&self, cancel: &CancellationToken, report: &mut AnalysisReport) -> Result<()> {
        self.config.validate()?;
        let nominal = self.model.nominal_point()?;
        self.model.log_likelihood(self.observed, nominal.values()).map_err(|e| {
            Error::Validation(format!("observed data cannot be evaluated by the model: {e}"))
        })?;

        let mle = MaximumLikelihoodEstimator::with_config(self.config.optimizer.clone());
        let built;
        let stat: &dyn TestStatistic = match &self.test_stat {
            Some(s) => s.as_ref(),
            None => {
                built = self.config.test_statistic.build(self.model, &mle)?;
                built.as_ref()
            }
        };
        report.statistic = stat.name().to_string();
        let toys = self.toy_generator()?;
        report.diagnostics.seed = toys.seed();

        let builder = ConfidenceBeltBuilder::new(self.model, stat, &mle, &toys)
            .with_config(self.config.belt_config())
            .with_cancellation(cancel);
        let inverter = self.config.inverter();

        // Belt over the initial grid.
        report.advance(AnalysisPhase::BeltBuilding)?;
        let grid = self.config.scan.grid(self.model.poi_bounds());
        let mut belt = builder.build(&grid, Some(self.observed))?;
        report.belt = Some(belt.clone());
        if belt.is_empty() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            return Err(Error::Computation(format!(
                "no scan point produced a usable sampling distribution ({} failed)",
                belt.n_failed_points()
            )));
        }
        report.advance(AnalysisPhase::BeltReady)?;

        // Observed inversion (also run on a partial belt).
        report.advance(AnalysisPhase::ObservedInversion)?;
        let (mut scan, mut interval) = self.invert_observed(stat, &belt, &inverter)?;
        report.observed_scan = Some(scan.clone());
        report.interval = Some(interval);
        report.advance(AnalysisPhase::IntervalReady)?;

        if let Some((fine_points, rounds)) = self.config.scan.refinement() {
            for _ in 0..rounds {
                if cancel.is_cancelled() {
                    break;
                }
                let fine = refinement_grid(&belt, &interval, fine_points);
                if fine.is_empty() {
                    break;
                }
                report.advance(AnalysisPhase::BeltBuilding)?;
                let extra = builder.build(&fine, Some(self.observed))?;
                belt.merge(extra)?;
                report.belt = Some(belt.clone());
                report.advance(AnalysisPhase::BeltReady)?;
                report.advance(AnalysisPhase::ObservedInversion)?;
                (scan, interval) = self.invert_observed(stat, &belt, &inverter)?;
                report.observed_scan = Some(scan.clone());
                report.interval = Some(interval);
                report.advance(AnalysisPhase::IntervalReady)?;
                report.diagnostics.n_refinements += 1;
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        if self.config.n_toy_mc == 0 {
            return report.advance(AnalysisPhase::Done);
        }

        report.advance(AnalysisPhase::ExpectedBandBuilding)?;
        let reference = self.reference_point(&mle, &nominal)?;
        let mut bands = ExpectedBandBuilder::new(self.model, stat, &belt, inverter, &toys)
            .with_cancellation(cancel);
        if self.config.interval == IntervalKind::UpperLimit
            && interval.upper.status == LimitStatus::Bracketed
        {
            let ul = interval.upper.value;
            match stat.evaluate(self.model, self.observed, ul) {
                Ok(t) => bands = bands.with_clb(ul, t.value),
                Err(e) if e.is_recoverable() => {
                    log::warn!("observed statistic at the upper limit failed: {e}; CLb skipped");
                }
                Err(e) => return Err(e),
            }
        }
        let band = bands.build(&reference, self.config.n_toy_mc)?;
        let complete = band.n_skipped == 0;
        report.band = Some(band);
        if complete && !cancel.is_cancelled() {
            report.advance(AnalysisPhase::Done)?;
        }
        Ok(())
    }

    fn invert_observed(
        &self,
        stat: &dyn TestStatistic,
        belt: &ConfidenceBelt,
        inverter: &crate::interval::IntervalInverter,
    ) -> Result<(ObservedScan, ConfidenceInterval)> {
        let scan = observed_scan(self.model, stat, self.observed, belt)?;
        if !scan.converged {
            log::warn!("observed fits did not all converge");
        }
        let interval = inverter.invert(belt, &scan)?;
        Ok((scan, interval))
    }

    /// Background-only point the band toys are generated at.
    fn reference_point(
        &self,
        mle: &MaximumLikelihoodEstimator,
        nominal: &ParameterPoint,
    ) -> Result<ParameterPoint> {
        let poi = self.config.reference_poi.unwrap_or(self.model.poi_bounds().0);
        match self.config.nuisance_policy {
            NuisancePolicy::Nominal => nominal.with_poi(poi),
            NuisancePolicy::Profiled => {
                let fit = mle.fit_conditional(self.model, self.observed, poi, None)?;
                nominal.with_values(fit.parameters)
            }
        }
    }

    fn fill_diagnostics(&self, report: &mut AnalysisReport) {
        let d = &mut report.diagnostics;
        if let Some(belt) = &report.belt {
            d.belt_toys = belt.toy_counts();
            d.n_scan_points = belt.len();
            d.n_failed_points = belt.n_failed_points();
            d.n_low_confidence_points = belt.n_low_confidence();
            d.n_unreliable_points = belt.n_unreliable();
        }
        if let Some(scan) = &report.observed_scan {
            d.n_observed_failures = scan.n_failed;
            d.observed_converged = scan.converged;
        }
        if let Some(band) = &report.band {
            d.band_toys_requested = band.n_requested;
            d.band_toys_failed = band.n_failed;
            d.band_toys_open = band.n_open;
            d.band_toys_skipped = band.n_skipped;
        }
    }
}

/// Interior points of each limit bracket not yet in `belt`.
fn refinement_grid(belt: &ConfidenceBelt, interval: &ConfidenceInterval, fine_points: usize) -> Vec<f64> {
    let mut out: Vec<f64> = [interval.lower.bracket, interval.upper.bracket]
        .into_iter()
        .flatten()
        .flat_map(|(a, b)| {
            let g = uniform_grid(a, b, fine_points);
            g[1..g.len() - 1].to_vec()
        })
        .filter(|v| belt.point_at(*v).is_none())
        .collect();
    out.sort_by(f64::total_cmp);
    out.dedup();
    out
}
