//! Loss-option flags and loss composition.
//!
//! The set of active options decides which terms enter each network's loss.
//! Composition is a pure function of that set and the computed terms.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use facevox_core::{Error, Result};
use facevox_model::{PenaltyKind, Reconstruction};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single loss option
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LossOption {
    /// Wasserstein realism loss
    #[serde(rename = "wass")]
    Wass,
    /// Gradient penalty (WGAN-GP with `wass`, DRAGAN otherwise)
    #[serde(rename = "GP")]
    GradientPenalty,
    /// Mean-squared reconstruction
    #[serde(rename = "recon")]
    Recon,
    /// Mean-absolute reconstruction
    #[serde(rename = "reconL1")]
    ReconL1,
    /// Pairwise distance preservation
    #[serde(rename = "dist")]
    Dist,
}

impl LossOption {
    pub const ALL: [LossOption; 5] = [
        LossOption::Wass,
        LossOption::GradientPenalty,
        LossOption::Recon,
        LossOption::ReconL1,
        LossOption::Dist,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LossOption::Wass => "wass",
            LossOption::GradientPenalty => "GP",
            LossOption::Recon => "recon",
            LossOption::ReconL1 => "reconL1",
            LossOption::Dist => "dist",
        }
    }
}

impl fmt::Display for LossOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LossOption::ALL
            .into_iter()
            .find(|option| option.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown loss option `{}`", s)))
    }
}

/// The active loss options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LossOptions(BTreeSet<LossOption>);

impl LossOptions {
    pub fn new<I: IntoIterator<Item = LossOption>>(options: I) -> Self {
        Self(options.into_iter().collect())
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, option: LossOption) -> bool {
        self.0.contains(&option)
    }

    pub fn iter(&self) -> impl Iterator<Item = LossOption> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `recon` and `reconL1` are mutually exclusive
    pub fn validate(&self) -> Result<()> {
        if self.contains(LossOption::Recon) && self.contains(LossOption::ReconL1) {
            return Err(Error::Config(
                "loss options `recon` and `reconL1` are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wasserstein(&self) -> bool {
        self.contains(LossOption::Wass)
    }

    /// Clip critic weights after each step: `wass` without `GP`
    pub fn clips_weights(&self) -> bool {
        self.wasserstein() && !self.contains(LossOption::GradientPenalty)
    }

    pub fn penalty(&self) -> Option<PenaltyKind> {
        if !self.contains(LossOption::GradientPenalty) {
            None
        } else if self.wasserstein() {
            Some(PenaltyKind::WassersteinGp)
        } else {
            Some(PenaltyKind::Dragan)
        }
    }

    pub fn reconstruction(&self) -> Option<Reconstruction> {
        if self.contains(LossOption::Recon) {
            Some(Reconstruction::Mse)
        } else if self.contains(LossOption::ReconL1) {
            Some(Reconstruction::L1)
        } else {
            None
        }
    }

    /// Comma-joined option names, e.g. `wass,GP`
    pub fn tag(&self) -> String {
        self.iter().map(LossOption::as_str).collect::<Vec<_>>().join(",")
    }
}

impl FromStr for LossOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(LossOption::from_str)
            .collect::<Result<BTreeSet<_>>>()
            .map(LossOptions)
    }
}

impl Serialize for LossOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for LossOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<LossOption>),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::List(options) => Ok(LossOptions::new(options)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A term that can enter a network's loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossTerm {
    GanReal,
    GanFake,
    Id,
    PCode,
    GradientPenalty,
    Recon,
    Distance,
}

impl LossTerm {
    /// Whether this term is part of the objective under `options`
    pub fn enabled(self, options: &LossOptions) -> bool {
        match self {
            LossTerm::GanReal | LossTerm::GanFake | LossTerm::Id | LossTerm::PCode => true,
            LossTerm::GradientPenalty => options.contains(LossOption::GradientPenalty),
            LossTerm::Recon => options.reconstruction().is_some(),
            LossTerm::Distance => options.contains(LossOption::Dist),
        }
    }
}

/// Sum the enabled terms in order.
pub fn compose(options: &LossOptions, components: &[(LossTerm, &Tensor)]) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (term, value) in components {
        if !term.enabled(options) {
            continue;
        }
        total = Some(match total {
            Some(sum) => (sum + *value)?,
            None => (*value).clone(),
        });
    }
    total.ok_or_else(|| Error::InvalidInput("no enabled loss terms to compose".to_string()))
}
