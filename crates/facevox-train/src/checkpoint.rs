//! Checkpoint persistence.
//!
//! A checkpoint is two safetensors parameter blobs (generator and
//! discriminator), the training history as JSON and a small manifest, all
//! keyed by the run id:
//!
//! ```text
//! <dir>/<run_id>_G.safetensors
//! <dir>/<run_id>_D.safetensors
//! <dir>/<run_id>_history.json
//! <dir>/<run_id>_manifest.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use facevox_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::history::TrainingHistory;
use crate::options::LossOptions;

/// Written next to the parameter blobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub run_id: String,
    /// Epochs completed when the checkpoint was taken
    pub epoch: usize,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    run_id: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run_id: run_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", self.run_id, suffix))
    }

    pub fn generator_path(&self) -> PathBuf {
        self.path("G.safetensors")
    }

    pub fn discriminator_path(&self) -> PathBuf {
        self.path("D.safetensors")
    }

    pub fn history_path(&self) -> PathBuf {
        self.path("history.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path("manifest.json")
    }

    /// Whether both parameter blobs are present
    pub fn exists(&self) -> bool {
        self.generator_path().is_file() && self.discriminator_path().is_file()
    }

    pub fn save(
        &self,
        generator: &VarMap,
        discriminator: &VarMap,
        history: &TrainingHistory,
        epoch: usize,
    ) -> Result<CheckpointManifest> {
        fs::create_dir_all(&self.dir)?;

        save_varmap(generator, &self.generator_path())?;
        save_varmap(discriminator, &self.discriminator_path())?;
        fs::write(self.history_path(), serde_json::to_vec(history)?)?;

        let manifest = CheckpointManifest {
            run_id: self.run_id.clone(),
            epoch,
            saved_at: Utc::now(),
        };
        fs::write(self.manifest_path(), serde_json::to_vec_pretty(&manifest)?)?;

        tracing::info!(run = %self.run_id, epoch, dir = %self.dir.display(), "checkpoint saved");
        Ok(manifest)
    }

    /// Restore parameters into the given maps and return the history.
    ///
    /// The maps must already hold every variable (construct the networks
    /// first). A missing or unreadable history is logged and replaced by a
    /// fresh one; a readable one is upgraded to the schema of `options`.
    pub fn load(
        &self,
        generator: &mut VarMap,
        discriminator: &mut VarMap,
        options: &LossOptions,
    ) -> Result<TrainingHistory> {
        load_varmap(generator, &self.generator_path())?;
        load_varmap(discriminator, &self.discriminator_path())?;

        let mut history = match self.read_history() {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(
                    path = %self.history_path().display(),
                    "could not restore training history, starting fresh: {}",
                    err
                );
                TrainingHistory::new(options)
            }
        };
        history.upgrade(options);

        tracing::info!(
            run = %self.run_id,
            epochs_completed = history.epochs_completed(),
            "checkpoint restored"
        );
        Ok(history)
    }

    fn read_history(&self) -> Result<TrainingHistory> {
        let bytes = fs::read(self.history_path())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn manifest(&self) -> Result<CheckpointManifest> {
        let bytes = fs::read(self.manifest_path())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn save_varmap(varmap: &VarMap, path: &Path) -> Result<()> {
    varmap
        .save(path)
        .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))
}

fn load_varmap(varmap: &mut VarMap, path: &Path) -> Result<()> {
    varmap
        .load(path)
        .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Metric;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(value: f64) -> candle_core::Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 3), "layer.weight", Init::Const(value))?;
        Ok(varmap)
    }

    fn weight(varmap: &VarMap) -> candle_core::Result<Vec<Vec<f32>>> {
        let data = varmap.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let var = data
            .get("layer.weight")
            .ok_or_else(|| candle_core::Error::Msg("missing var".to_string()))?;
        var.as_tensor().to_vec2()
    }

    #[test]
    fn test_round_trip_restores_parameters_and_history() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), "drgan3d_wass");
        let options: LossOptions = "wass".parse()?;

        let mut history = TrainingHistory::new(&options);
        history.push(Metric::DLoss, 0.25)?;
        history.push(Metric::PerEpochTime, 3.5)?;

        let manifest = store.save(&varmap_with(0.5)?, &varmap_with(-0.5)?, &history, 1)?;
        assert!(store.exists());
        assert_eq!(store.manifest()?.epoch, manifest.epoch);

        let mut generator = varmap_with(0.0)?;
        let mut discriminator = varmap_with(0.0)?;
        let restored = store.load(&mut generator, &mut discriminator, &options)?;

        assert_eq!(weight(&generator)?, vec![vec![0.5f32; 3]; 2]);
        assert_eq!(weight(&discriminator)?, vec![vec![-0.5f32; 3]; 2]);
        assert_eq!(restored, history);
        assert_eq!(restored.epochs_completed(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_history_starts_fresh() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), "run");
        let options = LossOptions::none();
        store.save(&varmap_with(1.0)?, &varmap_with(1.0)?, &TrainingHistory::new(&options), 0)?;
        fs::remove_file(store.history_path())?;

        let restored = store.load(&mut varmap_with(0.0)?, &mut varmap_with(0.0)?, &options)?;
        assert_eq!(restored, TrainingHistory::new(&options));
        Ok(())
    }

    #[test]
    fn test_history_is_upgraded_on_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), "run");
        let mut history = TrainingHistory::new(&LossOptions::none());
        history.push(Metric::GLoss, 1.0)?;
        store.save(&varmap_with(1.0)?, &varmap_with(1.0)?, &history, 0)?;

        let options: LossOptions = "recon".parse()?;
        let restored = store.load(&mut varmap_with(0.0)?, &mut varmap_with(0.0)?, &options)?;
        assert_eq!(restored.column(Metric::GLossRecon), Some(&[0.0][..]));
        Ok(())
    }

    #[test]
    fn test_missing_parameters_fail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), "absent");
        let mut generator = varmap_with(0.0)?;
        let mut discriminator = varmap_with(0.0)?;
        let result = store.load(&mut generator, &mut discriminator, &LossOptions::none());
        assert!(matches!(result, Err(Error::Checkpoint(_))));
        Ok(())
    }
}
