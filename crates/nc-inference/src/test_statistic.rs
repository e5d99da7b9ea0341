//! Test statistics.
//!
//! A test statistic maps `(dataset, tested POI value)` to a scalar. Larger values
//! are always "less compatible with the tested value" for the likelihood-ratio
//! family, which is the ordering the belt and p-value code rely on.

use crate::mle::MaximumLikelihoodEstimator;
use crate::optimizer::FitMinimum;
use nc_core::{Dataset, DatasetKind, Error, ParameterPoint, ParametricModel, Result};
use serde::{Deserialize, Serialize};

/// One evaluated test statistic.
#[derive(Debug, Clone, PartialEq)]
pub struct TestStatisticValue {
    /// Statistic value.
    pub value: f64,
    /// POI value the statistic was evaluated at.
    pub poi_value: f64,
    /// Every fit involved converged.
    pub converged: bool,
    /// Parameter point of the conditional fit (or the fixed point used), if any.
    pub point: Option<ParameterPoint>,
}

impl TestStatisticValue {
    fn plain(value: f64, poi_value: f64) -> Self {
        Self { value, poi_value, converged: true, point: None }
    }
}

/// A scalar summary of a dataset at a tested POI value.
pub trait TestStatistic: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Evaluate on `data` at `poi_value`.
    fn evaluate(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
    ) -> Result<TestStatisticValue>;

    /// Evaluate along a POI scan. Implementations may share work between points.
    fn evaluate_scan(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_values: &[f64],
    ) -> Result<Vec<TestStatisticValue>> {
        poi_values.iter().map(|&v| self.evaluate(model, data, v)).collect()
    }

    /// Whether the value changes with the tested POI value.
    fn depends_on_poi(&self) -> bool {
        true
    }
}

/// How the profile likelihood ratio treats fluctuations on either side of `mu_hat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlrPolicy {
    /// `q = 2 ΔNLL` everywhere (Feldman–Cousins ordering).
    TwoSided,
    /// Upper limits: `q = 0` when `mu_hat > mu`.
    #[default]
    OneSided,
    /// Discovery: `q = 0` when `mu_hat < mu`.
    OneSidedDiscovery,
    /// `-q` when `mu_hat > mu`.
    Signed,
}

/// Profile likelihood ratio `q_mu = 2 (NLL(mu, θ̂̂) - NLL(mû, θ̂))`.
#[derive(Debug, Clone)]
pub struct ProfileLikelihoodRatio {
    mle: MaximumLikelihoodEstimator,
    policy: PlrPolicy,
}

impl ProfileLikelihoodRatio {
    /// Statistic using `mle` for both fits.
    pub fn new(mle: MaximumLikelihoodEstimator, policy: PlrPolicy) -> Self {
        Self { mle, policy }
    }

    /// Sidedness policy.
    pub fn policy(&self) -> PlrPolicy {
        self.policy
    }

    fn with_free_fit(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        free: &FitMinimum,
        mu: f64,
        warm_start: &[f64],
    ) -> Result<(TestStatisticValue, Vec<f64>)> {
        let mu_hat = free.parameters[model.poi_index()];
        let clipped = match self.policy {
            PlrPolicy::OneSided => mu_hat > mu,
            PlrPolicy::OneSidedDiscovery => mu_hat < mu,
            PlrPolicy::TwoSided | PlrPolicy::Signed => false,
        };
        if clipped {
            let v = TestStatisticValue { converged: free.converged, ..TestStatisticValue::plain(0.0, mu) };
            return Ok((v, warm_start.to_vec()));
        }

        let cond = self.mle.fit_conditional(model, data, mu, Some(warm_start))?;
        // A conditional minimum below the free one means the free fit stopped early;
        // the ratio is then 0 by construction.
        let q = (2.0 * (cond.nll - free.nll)).max(0.0);
        let value = if self.policy == PlrPolicy::Signed && mu_hat > mu { -q } else { q };
        let point = model.point(cond.parameters.clone()).ok();
        let v = TestStatisticValue {
            value,
            poi_value: mu,
            converged: free.converged && cond.converged,
            point,
        };
        Ok((v, cond.parameters))
    }
}

impl TestStatistic for ProfileLikelihoodRatio {
    fn name(&self) -> &'static str {
        "profile_likelihood_ratio"
    }

    fn evaluate(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
    ) -> Result<TestStatisticValue> {
        let free = self.mle.fit_minimum(model, data)?;
        let (v, _) = self.with_free_fit(model, data, &free, poi_value, &free.parameters)?;
        Ok(v)
    }

    fn evaluate_scan(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_values: &[f64],
    ) -> Result<Vec<TestStatisticValue>> {
        let free = self.mle.fit_minimum(model, data)?;
        let mut warm = free.parameters.clone();
        let mut out = Vec::with_capacity(poi_values.len());
        for &mu in poi_values {
            let (v, next) = self.with_free_fit(model, data, &free, mu, &warm)?;
            warm = next;
            out.push(v);
        }
        Ok(out)
    }
}

/// `-2 ln(L(null) / L(alt)) = 2 (NLL(null) - NLL(alt))` at two fixed parameter points.
#[derive(Debug, Clone)]
pub struct SimpleLikelihoodRatio {
    null: ParameterPoint,
    alt: ParameterPoint,
}

impl SimpleLikelihoodRatio {
    /// Ratio between two fully specified hypotheses.
    pub fn new(null: ParameterPoint, alt: ParameterPoint) -> Result<Self> {
        if null.values().len() != alt.values().len() {
            return Err(Error::Validation(
                "simple likelihood ratio: null and alternative points differ in size".into(),
            ));
        }
        Ok(Self { null, alt })
    }
}

impl TestStatistic for SimpleLikelihoodRatio {
    fn name(&self) -> &'static str {
        "simple_likelihood_ratio"
    }

    fn evaluate(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
    ) -> Result<TestStatisticValue> {
        let null_nll = model.nll(data, self.null.values())?;
        let alt_nll = model.nll(data, self.alt.values())?;
        Ok(TestStatisticValue {
            point: Some(self.null.clone()),
            ..TestStatisticValue::plain(2.0 * (null_nll - alt_nll), poi_value)
        })
    }

    fn depends_on_poi(&self) -> bool {
        false
    }
}

/// `NLL_profiled(POI = tested) - NLL_profiled(POI = alt)`.
#[derive(Debug, Clone)]
pub struct RatioOfProfiledLikelihoods {
    mle: MaximumLikelihoodEstimator,
    alt_poi: f64,
}

impl RatioOfProfiledLikelihoods {
    /// Compare every tested value against the alternative `alt_poi`.
    pub fn new(mle: MaximumLikelihoodEstimator, alt_poi: f64) -> Self {
        Self { mle, alt_poi }
    }
}

impl TestStatistic for RatioOfProfiledLikelihoods {
    fn name(&self) -> &'static str {
        "ratio_of_profiled_likelihoods"
    }

    fn evaluate(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
    ) -> Result<TestStatisticValue> {
        let null = self.mle.fit_conditional(model, data, poi_value, None)?;
        let alt = self.mle.fit_conditional(model, data, self.alt_poi, Some(&null.parameters))?;
        Ok(TestStatisticValue {
            value: null.nll - alt.nll,
            poi_value,
            converged: null.converged && alt.converged,
            point: model.point(null.parameters).ok(),
        })
    }
}

/// Unconditional best-fit POI value.
#[derive(Debug, Clone)]
pub struct MaxLikelihoodEstimate {
    mle: MaximumLikelihoodEstimator,
}

impl MaxLikelihoodEstimate {
    /// Statistic using `mle` for the free fit.
    pub fn new(mle: MaximumLikelihoodEstimator) -> Self {
        Self { mle }
    }
}

impl TestStatistic for MaxLikelihoodEstimate {
    fn name(&self) -> &'static str {
        "max_likelihood_estimate"
    }

    fn evaluate(
        &self,
        model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
    ) -> Result<TestStatisticValue> {
        let free = self.mle.fit_minimum(model, data)?;
        Ok(TestStatisticValue {
            value: free.parameters[model.poi_index()],
            poi_value,
            converged: free.converged,
            point: model.point(free.parameters).ok(),
        })
    }

    fn depends_on_poi(&self) -> bool {
        false
    }
}

/// Number of events: the first count of a counting dataset, else the entry count.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumEvents;

impl TestStatistic for NumEvents {
    fn name(&self) -> &'static str {
        "num_events"
    }

    fn evaluate(
        &self,
        _model: &dyn ParametricModel,
        data: &Dataset,
        poi_value: f64,
    ) -> Result<TestStatisticValue> {
        let n = match data.kind() {
            DatasetKind::NumberCounting => data.entry(0)[0],
            DatasetKind::Extended | DatasetKind::Fixed => data.n_entries() as f64,
        };
        Ok(TestStatisticValue::plain(n, poi_value))
    }

    fn depends_on_poi(&self) -> bool {
        false
    }
}

/// Serialisable choice of test statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestStatisticConfig {
    /// See [`ProfileLikelihoodRatio`].
    ProfileLikelihoodRatio {
        /// Sidedness.
        #[serde(default)]
        policy: PlrPolicy,
    },
    /// See [`SimpleLikelihoodRatio`]; full parameter vectors in model order.
    SimpleLikelihoodRatio {
        /// Null hypothesis parameters.
        null: Vec<f64>,
        /// Alternative hypothesis parameters.
        alt: Vec<f64>,
    },
    /// See [`RatioOfProfiledLikelihoods`].
    RatioOfProfiledLikelihoods {
        /// POI value of the alternative.
        alt_poi: f64,
    },
    /// See [`MaxLikelihoodEstimate`].
    MaxLikelihoodEstimate,
    /// See [`NumEvents`].
    NumEvents,
}

impl Default for TestStatisticConfig {
    fn default() -> Self {
        TestStatisticConfig::ProfileLikelihoodRatio { policy: PlrPolicy::OneSided }
    }
}

impl TestStatisticConfig {
    /// Instantiate against `model`, validating any fixed points.
    pub fn build(
        &self,
        model: &dyn ParametricModel,
        mle: &MaximumLikelihoodEstimator,
    ) -> Result<Box<dyn TestStatistic>> {
        Ok(match self {
            TestStatisticConfig::ProfileLikelihoodRatio { policy } => {
                Box::new(ProfileLikelihoodRatio::new(mle.clone(), *policy))
            }
            TestStatisticConfig::SimpleLikelihoodRatio { null, alt } => Box::new(
                SimpleLikelihoodRatio::new(model.point(null.clone())?, model.point(alt.clone())?)?,
            ),
            TestStatisticConfig::RatioOfProfiledLikelihoods { alt_poi } => {
                let (lo, hi) = model.poi_bounds();
                if !(lo..=hi).contains(alt_poi) {
                    return Err(Error::Validation(format!(
                        "alternative POI {alt_poi} outside [{lo}, {hi}]"
                    )));
                }
                Box::new(RatioOfProfiledLikelihoods::new(mle.clone(), *alt_poi))
            }
            TestStatisticConfig::MaxLikelihoodEstimate => {
                Box::new(MaxLikelihoodEstimate::new(mle.clone()))
            }
            TestStatisticConfig::NumEvents => Box::new(NumEvents),
        })
    }
}
