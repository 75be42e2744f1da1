//! Training run configuration.

use std::path::PathBuf;

use facevox_core::{Error, Result};
use facevox_model::{DecoderConfig, DeviceType, DiscriminatorConfig, EncoderConfig, GeneratorConfig};
use serde::{Deserialize, Serialize};

use crate::options::LossOptions;

/// `n_critic` used whenever the Wasserstein loss is active
pub const WASSERSTEIN_CRITIC_STEPS: usize = 5;

/// Complete training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Base name of the run; the loss-option tag is appended to form the run id
    pub run_name: String,
    pub epochs: usize,
    pub batch_size: usize,
    /// Discriminator updates per mini-batch
    pub n_critic: usize,
    /// Generator updates per mini-batch
    pub n_gen: usize,
    /// Window of the discriminator accuracy gate
    pub n_dacc_avg: usize,
    pub loss_options: LossOptions,
    pub model: ModelDims,
    pub optimizer: OptimizerConfig,
    /// Where checkpoints are written; none disables checkpointing
    pub checkpoint_dir: Option<PathBuf>,
    pub seed: u64,
    /// Batches between progress summaries
    pub log_every: usize,
    pub device: DeviceType,
}

/// Network sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDims {
    /// Volume grid size `S`
    pub resolution: usize,
    /// 1 (occupancy) or 4 (occupancy + RGB)
    pub volume_channels: usize,
    pub image_size: usize,
    pub image_channels: usize,
    /// Embedding width `E`
    pub embedding_dim: usize,
    pub n_id: usize,
    pub n_pcode: usize,
    /// Noise width `Nz`
    pub n_noise: usize,
    pub encoder_channels: usize,
    pub decoder_channels: usize,
    pub discriminator_channels: usize,
    pub max_channels: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr_g: f64,
    pub lr_d: f64,
    pub beta1: f64,
    pub beta2: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run_name: "drgan3d".to_string(),
            epochs: 25,
            batch_size: 8,
            n_critic: 1,
            n_gen: 1,
            n_dacc_avg: 10,
            loss_options: LossOptions::none(),
            model: ModelDims::default(),
            optimizer: OptimizerConfig::default(),
            checkpoint_dir: None,
            seed: 547,
            log_every: 10,
            device: DeviceType::Cpu,
        }
    }
}

impl Default for ModelDims {
    fn default() -> Self {
        Self {
            resolution: 64,
            volume_channels: 4,
            image_size: 64,
            image_channels: 3,
            embedding_dim: 320,
            n_id: 105,
            n_pcode: 48,
            n_noise: 50,
            encoder_channels: 64,
            decoder_channels: 16,
            discriminator_channels: 32,
            max_channels: 512,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr_g: 2e-4,
            lr_d: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
        }
    }
}

impl ModelDims {
    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            encoder: EncoderConfig {
                in_channels: self.image_channels,
                image_size: self.image_size,
                base_channels: self.encoder_channels,
                max_channels: self.max_channels,
                embedding_dim: self.embedding_dim,
            },
            decoder: DecoderConfig {
                embedding_dim: self.embedding_dim,
                n_pcode: self.n_pcode,
                n_noise: self.n_noise,
                resolution: self.resolution,
                out_channels: self.volume_channels,
                base_channels: self.decoder_channels,
                max_channels: self.max_channels,
            },
        }
    }

    pub fn discriminator(&self) -> DiscriminatorConfig {
        DiscriminatorConfig {
            in_channels: self.volume_channels,
            resolution: self.resolution,
            base_channels: self.discriminator_channels,
            max_channels: self.max_channels,
            n_id: self.n_id,
            n_pcode: self.n_pcode,
        }
    }
}

impl TrainingConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FACEVOX").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Load from environment variables
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("FACEVOX").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        self.loss_options.validate()?;

        let positive = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("n_critic", self.n_critic),
            ("n_gen", self.n_gen),
            ("n_dacc_avg", self.n_dacc_avg),
            ("model.n_id", self.model.n_id),
            ("model.n_pcode", self.model.n_pcode),
            ("model.n_noise", self.model.n_noise),
            ("model.embedding_dim", self.model.embedding_dim),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("`{}` must be positive", name)));
        }
        if !matches!(self.model.volume_channels, 1 | 4) {
            return Err(Error::Config(format!(
                "`model.volume_channels` must be 1 or 4, got {}",
                self.model.volume_channels
            )));
        }
        if self.loss_options.contains(crate::options::LossOption::Dist) && self.batch_size < 2 {
            return Err(Error::Config("`dist` needs a batch of at least two samples".to_string()));
        }
        Ok(())
    }

    /// Discriminator steps per batch; forced to 5 under `wass`
    pub fn effective_n_critic(&self) -> usize {
        if self.loss_options.wasserstein() {
            WASSERSTEIN_CRITIC_STEPS
        } else {
            self.n_critic
        }
    }

    /// Run identifier keying the checkpoint files, e.g. `drgan3d_wass,GP`
    pub fn run_id(&self) -> String {
        if self.loss_options.is_empty() {
            self.run_name.clone()
        } else {
            format!("{}_{}", self.run_name, self.loss_options.tag())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LossOption;

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.run_id(), "drgan3d");
        assert_eq!(config.effective_n_critic(), 1);
    }

    #[test]
    fn test_wass_forces_five_critic_steps() {
        let config = TrainingConfig {
            loss_options: LossOptions::new([LossOption::Wass, LossOption::GradientPenalty]),
            n_critic: 2,
            ..Default::default()
        };
        assert_eq!(config.effective_n_critic(), 5);
        assert_eq!(config.run_id(), "drgan3d_wass,GP");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let config = TrainingConfig {
            loss_options: "recon,reconL1".parse().unwrap(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TrainingConfig::default();
        config.model.volume_channels = 3;
        assert!(config.validate().is_err());

        let config = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_option_string() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"run_name":"bos","loss_options":"wass,dist","model":{"n_pcode":12}}"#).unwrap();
        assert_eq!(config.run_id(), "bos_wass,dist");
        assert_eq!(config.model.n_pcode, 12);
        assert_eq!(config.model.resolution, 64);
    }

    #[test]
    fn test_model_dims_feed_both_networks() {
        let dims = ModelDims::default();
        assert_eq!(dims.generator().decoder.out_channels, dims.discriminator().in_channels);
        assert_eq!(dims.generator().decoder.n_pcode, dims.discriminator().n_pcode);
    }
}
