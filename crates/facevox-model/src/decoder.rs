//! Conditional decoder: (embedding, condition, noise) to volume.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::conv3d::{conv_transpose3d_no_bias, Conv3dConfig, ConvTranspose3d};
use crate::pyramid;

/// Configuration for the conditional decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Embedding width `E`
    pub embedding_dim: usize,
    /// Pose/expression code count `Npcode`
    pub n_pcode: usize,
    /// Noise width `Nz`
    pub n_noise: usize,
    /// Output grid size `S`, `4 · 2^k`
    pub resolution: usize,
    /// 1 (occupancy) or 4 (occupancy + RGB)
    pub out_channels: usize,
    /// Stage `i` of `n` is `base_channels · 2^(n - i)` wide
    pub base_channels: usize,
    /// Cap on stage width
    pub max_channels: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 320,
            n_pcode: 48,
            n_noise: 50,
            resolution: 64,
            out_channels: 4,
            base_channels: 16,
            max_channels: 512,
        }
    }
}

impl DecoderConfig {
    /// Width of the concatenated input feature
    pub fn input_dim(&self) -> usize {
        self.embedding_dim + self.n_pcode + self.n_noise
    }
}

/// Transposed convolution optionally followed by batch norm
struct UpBlock {
    conv: ConvTranspose3d,
    norm: Option<BatchNorm>,
}

impl UpBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        match &self.norm {
            Some(norm) => norm.forward_t(&x, train)?.relu(),
            None => candle_nn::ops::sigmoid(&x),
        }
    }
}

/// Projects the conditioned feature back to `E` and upsamples it to a volume.
///
/// The stem lifts the `1³` seed to `4³`; each following stage doubles the
/// spatial size. Only the last stage skips normalization and ends in a
/// sigmoid.
pub struct ConditionalDecoder {
    projection: Linear,
    blocks: Vec<UpBlock>,
    config: DecoderConfig,
}

impl ConditionalDecoder {
    pub fn new(config: DecoderConfig, vb: VarBuilder) -> facevox_core::Result<Self> {
        let depth = pyramid::depth(config.resolution, "conditional decoder resolution")?;
        let projection = linear(config.input_dim(), config.embedding_dim, vb.pp("projection"))?;

        let width = |stage: usize| pyramid::widen(config.base_channels, depth - stage, config.max_channels);
        let mut blocks = Vec::with_capacity(depth + 1);

        let stem_channels = width(0);
        blocks.push(UpBlock {
            conv: conv_transpose3d_no_bias(
                config.embedding_dim,
                stem_channels,
                pyramid::BASE_SIZE,
                Conv3dConfig::default(),
                vb.pp("stem"),
            )?,
            norm: Some(batch_norm(stem_channels, 1e-5, vb.pp("stem_norm"))?),
        });

        let upsample = Conv3dConfig { padding: 1, stride: 2 };
        let mut channels = stem_channels;
        for stage in 1..=depth {
            let last = stage == depth;
            let out = if last { config.out_channels } else { width(stage) };
            let conv = conv_transpose3d_no_bias(channels, out, 4, upsample, vb.pp(format!("up_{}", stage)))?;
            let norm = if last {
                None
            } else {
                Some(batch_norm(out, 1e-5, vb.pp(format!("up_{}_norm", stage)))?)
            };
            blocks.push(UpBlock { conv, norm });
            channels = out;
        }

        Ok(Self {
            projection,
            blocks,
            config,
        })
    }

    /// Decode a batch
    ///
    /// # Arguments
    /// * `embedding` - `[batch, embedding_dim]`
    /// * `condition` - one-hot `[batch, n_pcode]`
    /// * `noise` - `[batch, n_noise]`
    ///
    /// # Returns
    /// Volumes `[batch, out_channels, S, S, S]` with values in `[0, 1]`
    pub fn forward_t(&self, embedding: &Tensor, condition: &Tensor, noise: &Tensor, train: bool) -> Result<Tensor> {
        let features = Tensor::cat(&[embedding, condition, noise], 1)?;
        let x = self.projection.forward(&features)?;
        let batch = x.dim(0)?;
        let mut x = x.reshape((batch, self.config.embedding_dim, 1, 1, 1))?;
        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }
        Ok(x)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}
