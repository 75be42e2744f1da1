//! Reconstruction engine: images to volumes with a trained generator.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use facevox_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::generator::{Generator, GeneratorConfig};
use crate::loss::one_hot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceType {
    pub fn device(self) -> Result<Device> {
        Ok(match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceType::Metal => Device::new_metal(0)?,
        })
    }
}

/// Reconstruction engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InferenceConfig {
    pub generator: GeneratorConfig,
    pub device: DeviceType,
}

/// Runs the generator in evaluation mode
pub struct ReconstructionEngine {
    generator: Generator,
    device: Device,
    config: InferenceConfig,
}

impl ReconstructionEngine {
    /// Create an engine with random weights (for testing)
    pub fn new_random(config: InferenceConfig) -> Result<Self> {
        let device = config.device.device()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let generator = Generator::new(config.generator.clone(), vb)?;
        Ok(Self {
            generator,
            device,
            config,
        })
    }

    /// Load generator weights from a safetensors checkpoint
    pub fn load<P: AsRef<Path>>(path: P, config: InferenceConfig) -> Result<Self> {
        let path = path.as_ref();
        let device = config.device.device()?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let generator = Generator::new(config.generator.clone(), vb)?;
        varmap
            .load(path)
            .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))?;

        tracing::info!(path = %path.display(), "loaded generator weights");
        Ok(Self {
            generator,
            device,
            config,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Reconstruct one volume per image
    ///
    /// # Arguments
    /// * `images` - `[B, C, H, W]`
    /// * `pcodes` - one pose/expression code per image
    /// * `noise` - `[B, n_noise]`; drawn uniformly when `None`
    pub fn reconstruct(&self, images: &Tensor, pcodes: &[usize], noise: Option<&Tensor>) -> Result<Tensor> {
        let dec = &self.config.generator.decoder;
        let condition = one_hot(pcodes, dec.n_pcode, &self.device)?;
        let noise = match noise {
            Some(noise) => noise.clone(),
            None => Tensor::rand(0f32, 1.0, (pcodes.len(), dec.n_noise), &self.device)?,
        };
        self.generator.generate(images, &condition, &noise, false)
    }

    /// Reconstruct a single image `[C, H, W]` under every pose/expression code.
    ///
    /// The same noise vector is shared across codes. Returns
    /// `[n_pcode, C_out, S, S, S]`.
    pub fn sweep_codes(&self, image: &Tensor) -> Result<Tensor> {
        let n_pcode = self.config.generator.decoder.n_pcode;
        let n_noise = self.config.generator.decoder.n_noise;

        let images = image.unsqueeze(0)?.repeat((n_pcode, 1, 1, 1))?;
        let noise = Tensor::rand(0f32, 1.0, (1, n_noise), &self.device)?.repeat((n_pcode, 1))?;
        let codes: Vec<usize> = (0..n_pcode).collect();
        self.reconstruct(&images, &codes, Some(&noise))
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderConfig;
    use crate::encoder::EncoderConfig;

    fn tiny_config() -> InferenceConfig {
        InferenceConfig {
            generator: GeneratorConfig {
                encoder: EncoderConfig {
                    in_channels: 3,
                    image_size: 8,
                    base_channels: 4,
                    max_channels: 8,
                    embedding_dim: 6,
                },
                decoder: DecoderConfig {
                    embedding_dim: 6,
                    n_pcode: 3,
                    n_noise: 4,
                    resolution: 8,
                    out_channels: 4,
                    base_channels: 2,
                    max_channels: 8,
                },
            },
            device: DeviceType::Cpu,
        }
    }

    #[test]
    fn test_sweep_covers_every_code() -> Result<()> {
        let engine = ReconstructionEngine::new_random(tiny_config())?;
        let image = Tensor::rand(0f32, 1.0, (3, 8, 8), engine.device())?;
        let volumes = engine.sweep_codes(&image)?;
        assert_eq!(volumes.dims(), &[3, 4, 8, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_reconstruct_rejects_out_of_range_code() -> Result<()> {
        let engine = ReconstructionEngine::new_random(tiny_config())?;
        let images = Tensor::rand(0f32, 1.0, (1, 3, 8, 8), engine.device())?;
        assert!(engine.reconstruct(&images, &[3], None).is_err());
        Ok(())
    }
}
