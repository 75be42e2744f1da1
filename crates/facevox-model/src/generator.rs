//! Generator: image to volume, conditioned on a pose/expression code and noise.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use facevox_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::decoder::{ConditionalDecoder, DecoderConfig};
use crate::encoder::{EncoderConfig, IdentityEncoder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeneratorConfig {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
}

impl GeneratorConfig {
    fn validate(&self) -> Result<()> {
        if self.encoder.embedding_dim != self.decoder.embedding_dim {
            return Err(Error::shape_mismatch(
                "generator embedding width",
                &[self.encoder.embedding_dim],
                &[self.decoder.embedding_dim],
            ));
        }
        if !matches!(self.decoder.out_channels, 1 | 4) {
            return Err(Error::InvalidInput(format!(
                "generator output channels must be 1 or 4, got {}",
                self.decoder.out_channels
            )));
        }
        Ok(())
    }
}

/// `decode(encode(image), condition, noise)`
pub struct Generator {
    encoder: IdentityEncoder,
    decoder: ConditionalDecoder,
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(config: GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let encoder = IdentityEncoder::new(config.encoder.clone(), vb.pp("encoder"))?;
        let decoder = ConditionalDecoder::new(config.decoder.clone(), vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            config,
        })
    }

    /// Reconstruct volumes for a batch of images.
    ///
    /// Shapes are checked before any computation:
    /// * `images` - `[B, in_channels, image_size, image_size]`
    /// * `condition` - `[B, n_pcode]`
    /// * `noise` - `[B, n_noise]`
    pub fn generate(&self, images: &Tensor, condition: &Tensor, noise: &Tensor, train: bool) -> Result<Tensor> {
        let enc = &self.config.encoder;
        let dec = &self.config.decoder;

        let batch = images.dims().first().copied().unwrap_or(0);
        check_shape(
            "generator image batch",
            images,
            &[batch, enc.in_channels, enc.image_size, enc.image_size],
        )?;
        check_shape("generator condition", condition, &[batch, dec.n_pcode])?;
        check_shape("generator noise", noise, &[batch, dec.n_noise])?;

        let embedding = self.encoder.forward_t(images, train)?;
        Ok(self.decoder.forward_t(&embedding, condition, noise, train)?)
    }

    /// Output shape `[C, S, S, S]` of a single generated volume
    pub fn volume_shape(&self) -> [usize; 4] {
        let dec = &self.config.decoder;
        [dec.out_channels, dec.resolution, dec.resolution, dec.resolution]
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

/// Fail with `ShapeMismatch` unless `tensor` has exactly `expected` dims
pub fn check_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() != expected {
        return Err(Error::shape_mismatch(context, expected, tensor.dims()));
    }
    Ok(())
}
