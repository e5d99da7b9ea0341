//! Declarative model definitions.
//!
//! A [`ModelSpec`] is the serialisable description of one of the built-in models;
//! [`ModelSpec::build`] turns it into an [`AnyModel`] implementing
//! [`ParametricModel`].

use crate::multi_channel::{Channel, EfficiencyConstraint};
use crate::{
    GaussOverFlatModel, GaussianMeanModel, MultiChannelOnOffModel, OnOffModel, PoissonCountModel,
};
use nc_core::{CountPolicy, Dataset, ParameterSpec, ParametricModel, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// `value [min, max]` declaration of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeSpec {
    /// Nominal value.
    pub value: f64,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Hold at `value`.
    #[serde(default)]
    pub fixed: bool,
}

impl RangeSpec {
    fn to_parameter(self, name: &str) -> Result<ParameterSpec> {
        let mut p = ParameterSpec::new(name, self.value, self.min, self.max)?;
        p.fixed = self.fixed;
        Ok(p)
    }
}

/// One channel of a [`ModelSpec::MultiChannelOnOff`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Signal expected at unit signal strength.
    pub signal: f64,
    /// Sideband to signal-region background ratio.
    pub tau: f64,
    /// Signal-region background.
    pub background: RangeSpec,
}

/// Gaussian-constrained efficiency of a [`ModelSpec::MultiChannelOnOff`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EfficiencySpec {
    /// Auxiliary measurement.
    pub nominal: f64,
    /// Its uncertainty.
    pub sigma: f64,
    /// Fit range of the efficiency.
    pub range: RangeSpec,
}

/// Serialisable model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSpec {
    /// `x ~ Pois(s + b)`, `y ~ Pois(tau b)`.
    OnOff {
        /// Off/on background ratio.
        tau: f64,
        /// Signal yield `s` (POI).
        signal: RangeSpec,
        /// Background yield `b`.
        background: RangeSpec,
    },
    /// Product of on/off channels sharing a signal strength `mu`.
    MultiChannelOnOff {
        /// Signal strength `mu` (POI).
        signal_strength: RangeSpec,
        /// Channels, in observable order.
        channels: Vec<ChannelSpec>,
        /// Optional constrained efficiency scaling every channel's signal.
        #[serde(default)]
        efficiency: Option<EfficiencySpec>,
    },
    /// `x ~ Pois(mu + background)`.
    PoissonCount {
        /// Known background.
        background: f64,
        /// Signal mean `mu` (POI).
        signal: RangeSpec,
    },
    /// `x ~ N(mu, sigma)` on a window.
    GaussianMean {
        /// Known width.
        sigma: f64,
        /// Observable window.
        observable_range: (f64, f64),
        /// Mean `mu` (POI).
        mean: RangeSpec,
        /// Expected entry count for extended generation.
        #[serde(default)]
        expected_events: Option<f64>,
    },
    /// `S · Gauss + B · Uniform` on a mass window.
    GaussOverFlat {
        /// Mass window.
        observable_range: (f64, f64),
        /// Peak position.
        peak_mean: f64,
        /// Peak width.
        peak_width: f64,
        /// Signal yield `S` (POI).
        signal: RangeSpec,
        /// Background yield `B`.
        background: RangeSpec,
    },
}

impl ModelSpec {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Instantiate the model.
    pub fn build(&self) -> Result<AnyModel> {
        let model = match self {
            ModelSpec::OnOff { tau, signal, background } => AnyModel::OnOff(OnOffModel::new(
                *tau,
                signal.to_parameter("s")?,
                background.to_parameter("b")?,
            )?),
            ModelSpec::MultiChannelOnOff { signal_strength, channels, efficiency } => {
                let channels = channels
                    .iter()
                    .enumerate()
                    .map(|(i, ch)| {
                        Ok(Channel {
                            signal: ch.signal,
                            tau: ch.tau,
                            background: ch.background.to_parameter(&format!("b_{i}"))?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut m =
                    MultiChannelOnOffModel::new(signal_strength.to_parameter("mu")?, channels)?;
                if let Some(e) = efficiency {
                    m = m.with_efficiency(EfficiencyConstraint {
                        parameter: e.range.to_parameter("eff")?,
                        nominal: e.nominal,
                        sigma: e.sigma,
                    })?;
                }
                AnyModel::MultiChannelOnOff(m)
            }
            ModelSpec::PoissonCount { background, signal } => AnyModel::PoissonCount(
                PoissonCountModel::new(*background, signal.to_parameter("mu")?)?,
            ),
            ModelSpec::GaussianMean { sigma, observable_range, mean, expected_events } => {
                let mut m =
                    GaussianMeanModel::new(mean.to_parameter("mu")?, *sigma, *observable_range)?;
                if let Some(nu) = expected_events {
                    m = m.with_expected_events(*nu)?;
                }
                AnyModel::GaussianMean(m)
            }
            ModelSpec::GaussOverFlat {
                observable_range,
                peak_mean,
                peak_width,
                signal,
                background,
            } => AnyModel::GaussOverFlat(GaussOverFlatModel::new(
                *observable_range,
                *peak_mean,
                *peak_width,
                signal.to_parameter("S")?,
                background.to_parameter("B")?,
            )?),
        };
        log::debug!("built model '{}' with {} parameters", model.name(), model.dim());
        Ok(model)
    }
}

/// Any of the built-in models.
#[derive(Debug, Clone)]
pub enum AnyModel {
    /// See [`OnOffModel`].
    OnOff(OnOffModel),
    /// See [`MultiChannelOnOffModel`].
    MultiChannelOnOff(MultiChannelOnOffModel),
    /// See [`PoissonCountModel`].
    PoissonCount(PoissonCountModel),
    /// See [`GaussianMeanModel`].
    GaussianMean(GaussianMeanModel),
    /// See [`GaussOverFlatModel`].
    GaussOverFlat(GaussOverFlatModel),
}

impl AnyModel {
    fn inner(&self) -> &dyn ParametricModel {
        match self {
            AnyModel::OnOff(m) => m,
            AnyModel::MultiChannelOnOff(m) => m,
            AnyModel::PoissonCount(m) => m,
            AnyModel::GaussianMean(m) => m,
            AnyModel::GaussOverFlat(m) => m,
        }
    }
}

impl ParametricModel for AnyModel {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn parameters(&self) -> &[ParameterSpec] {
        self.inner().parameters()
    }

    fn poi_index(&self) -> usize {
        self.inner().poi_index()
    }

    fn observable_names(&self) -> Vec<String> {
        self.inner().observable_names()
    }

    fn is_number_counting(&self) -> bool {
        self.inner().is_number_counting()
    }

    fn can_be_extended(&self) -> bool {
        self.inner().can_be_extended()
    }

    fn expected_events(&self, params: &[f64]) -> Result<f64> {
        self.inner().expected_events(params)
    }

    fn log_likelihood(&self, data: &Dataset, params: &[f64]) -> Result<f64> {
        self.inner().log_likelihood(data, params)
    }

    fn grad_nll(&self, data: &Dataset, params: &[f64]) -> Result<Vec<f64>> {
        self.inner().grad_nll(data, params)
    }

    fn sample(
        &self,
        params: &[f64],
        policy: CountPolicy,
        rng: &mut dyn RngCore,
    ) -> Result<Dataset> {
        self.inner().sample(params, policy, rng)
    }
}
