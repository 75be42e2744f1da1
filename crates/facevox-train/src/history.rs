//! Training history: append-only metric columns with a schema fixed per run.

use std::collections::BTreeMap;

use facevox_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::options::{LossOption, LossOptions};

/// How often a metric is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    Batch,
    Epoch,
    Run,
}

/// A recorded metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    DLoss,
    DLossGanReal,
    DLossId,
    DLossPCode,
    DLossGanFake,
    DLossGp,
    DAcc,
    GLoss,
    GLossGanFake,
    GLossId,
    GLossPCode,
    GLossRecon,
    GLossDist,
    PerEpochTime,
    TotalTime,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::DLoss => "D_loss",
            Metric::DLossGanReal => "D_loss_GAN_real",
            Metric::DLossId => "D_loss_id",
            Metric::DLossPCode => "D_loss_pcode",
            Metric::DLossGanFake => "D_loss_GAN_fake",
            Metric::DLossGp => "D_loss_GP",
            Metric::DAcc => "D_acc",
            Metric::GLoss => "G_loss",
            Metric::GLossGanFake => "G_loss_GAN_fake",
            Metric::GLossId => "G_loss_id",
            Metric::GLossPCode => "G_loss_pcode",
            Metric::GLossRecon => "G_loss_recon",
            Metric::GLossDist => "G_loss_dist",
            Metric::PerEpochTime => "per_epoch_time",
            Metric::TotalTime => "total_time",
        }
    }

    pub fn cadence(self) -> Cadence {
        match self {
            Metric::PerEpochTime => Cadence::Epoch,
            Metric::TotalTime => Cadence::Run,
            _ => Cadence::Batch,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    const ALL: [Metric; 15] = [
        Metric::DLoss,
        Metric::DLossGanReal,
        Metric::DLossId,
        Metric::DLossPCode,
        Metric::DLossGanFake,
        Metric::DLossGp,
        Metric::DAcc,
        Metric::GLoss,
        Metric::GLossGanFake,
        Metric::GLossId,
        Metric::GLossPCode,
        Metric::GLossRecon,
        Metric::GLossDist,
        Metric::PerEpochTime,
        Metric::TotalTime,
    ];
}

/// Columns recorded under `options`
pub fn schema(options: &LossOptions) -> Vec<Metric> {
    let mut metrics = vec![
        Metric::DLoss,
        Metric::DLossGanReal,
        Metric::DLossId,
        Metric::DLossPCode,
        Metric::DLossGanFake,
        Metric::DAcc,
        Metric::GLoss,
        Metric::GLossGanFake,
        Metric::GLossId,
        Metric::GLossPCode,
        Metric::PerEpochTime,
        Metric::TotalTime,
    ];
    if options.contains(LossOption::GradientPenalty) {
        metrics.push(Metric::DLossGp);
    }
    if options.reconstruction().is_some() {
        metrics.push(Metric::GLossRecon);
    }
    if options.contains(LossOption::Dist) {
        metrics.push(Metric::GLossDist);
    }
    metrics
}

/// Named metric columns.
///
/// Serialized as a flat JSON object of `name -> [values]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingHistory {
    columns: BTreeMap<String, Vec<f64>>,
}

impl TrainingHistory {
    /// Empty columns for every metric of `options`
    pub fn new(options: &LossOptions) -> Self {
        Self {
            columns: schema(options)
                .into_iter()
                .map(|m| (m.name().to_string(), Vec::new()))
                .collect(),
        }
    }

    /// Bring a restored history up to the schema of `options`.
    ///
    /// Missing columns are backfilled with zeros to the longest existing
    /// column of the same cadence. Columns outside the schema are kept.
    /// Returns the names of the added columns.
    pub fn upgrade(&mut self, options: &LossOptions) -> Vec<&'static str> {
        let mut added = Vec::new();
        for metric in schema(options) {
            if self.columns.contains_key(metric.name()) {
                continue;
            }
            let len = self.longest(metric.cadence());
            self.columns.insert(metric.name().to_string(), vec![0.0; len]);
            tracing::warn!(column = metric.name(), backfilled = len, "history column added");
            added.push(metric.name());
        }
        added
    }

    fn longest(&self, cadence: Cadence) -> usize {
        self.columns
            .iter()
            .filter(|(name, _)| Metric::from_name(name).map(Metric::cadence) == Some(cadence))
            .map(|(_, values)| values.len())
            .max()
            .unwrap_or(0)
    }

    pub fn push(&mut self, metric: Metric, value: f64) -> Result<()> {
        match self.columns.get_mut(metric.name()) {
            Some(column) => {
                column.push(value);
                Ok(())
            }
            None => Err(Error::InvalidInput(format!(
                "metric `{}` is not part of this run's history",
                metric.name()
            ))),
        }
    }

    pub fn column(&self, metric: Metric) -> Option<&[f64]> {
        self.columns.get(metric.name()).map(Vec::as_slice)
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn len(&self, metric: Metric) -> usize {
        self.column(metric).map_or(0, <[f64]>::len)
    }

    pub fn last(&self, metric: Metric) -> Option<f64> {
        self.column(metric).and_then(|c| c.last().copied())
    }

    /// Completed epochs, the resume point of a restored run
    pub fn epochs_completed(&self) -> usize {
        self.len(Metric::PerEpochTime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_follows_options() {
        let plain = schema(&LossOptions::none());
        assert!(plain.contains(&Metric::DAcc));
        assert!(!plain.contains(&Metric::DLossGp));
        assert!(!plain.contains(&Metric::GLossRecon));

        let full = schema(&"GP,reconL1,dist".parse().unwrap());
        assert!(full.contains(&Metric::DLossGp));
        assert!(full.contains(&Metric::GLossRecon));
        assert!(full.contains(&Metric::GLossDist));
    }

    #[test]
    fn test_push_outside_schema_is_rejected() {
        let mut history = TrainingHistory::new(&LossOptions::none());
        assert!(history.push(Metric::DLoss, 1.0).is_ok());
        assert!(history.push(Metric::GLossDist, 1.0).is_err());
    }

    #[test]
    fn test_upgrade_backfills_by_cadence() {
        let mut history = TrainingHistory::new(&LossOptions::none());
        for v in [0.5, 0.6, 0.7] {
            history.push(Metric::DLoss, v).unwrap();
        }
        history.push(Metric::PerEpochTime, 12.0).unwrap();

        let json = serde_json::to_string(&history).unwrap();
        let mut restored: TrainingHistory = serde_json::from_str(&json).unwrap();
        let added = restored.upgrade(&"recon,dist".parse().unwrap());

        assert_eq!(added, vec!["G_loss_recon", "G_loss_dist"]);
        assert_eq!(restored.column(Metric::GLossRecon), Some(&[0.0, 0.0, 0.0][..]));
        assert_eq!(restored.epochs_completed(), 1);
    }

    #[test]
    fn test_upgrade_keeps_extra_columns() {
        let mut history: TrainingHistory =
            serde_json::from_str(r#"{"D_loss":[1.0],"legacy_metric":[3.0,4.0]}"#).unwrap();
        history.upgrade(&LossOptions::none());
        assert_eq!(history.get("legacy_metric"), Some(&[3.0, 4.0][..]));
        assert_eq!(history.len(Metric::GLoss), 1);
        assert_eq!(history.len(Metric::TotalTime), 0);
    }
}
