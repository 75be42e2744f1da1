//! Identity encoder: 2D image to bounded embedding.
//!
//! A pyramid of stride-2 convolutions (batch norm + ReLU) reduces the image
//! to a 4×4 map; a final 4×4 convolution collapses it to one vector whose
//! components are squashed into `[0, 1]` by a sigmoid.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::pyramid;

/// Configuration for the identity encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Image channels (3 for RGB)
    pub in_channels: usize,
    /// Square input size, `4 · 2^k`
    pub image_size: usize,
    /// Width of the first stage
    pub base_channels: usize,
    /// Cap on stage width
    pub max_channels: usize,
    /// Embedding width `E`
    pub embedding_dim: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            image_size: 64,
            base_channels: 64,
            max_channels: 512,
            embedding_dim: 320,
        }
    }
}

/// Strided 2D convolution with batch norm and ReLU
struct DownBlock {
    conv: Conv2d,
    norm: BatchNorm,
}

impl DownBlock {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 4, config, vb.pp("conv"))?;
        let norm = batch_norm(out_channels, 1e-5, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.norm.forward_t(&x, train)?;
        x.relu()
    }
}

pub struct IdentityEncoder {
    blocks: Vec<DownBlock>,
    head: Conv2d,
    config: EncoderConfig,
}

impl IdentityEncoder {
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> facevox_core::Result<Self> {
        let depth = pyramid::depth(config.image_size, "identity encoder image size")?;

        let mut blocks = Vec::with_capacity(depth);
        let mut channels = config.in_channels;
        for i in 0..depth {
            let out = pyramid::widen(config.base_channels, i, config.max_channels);
            blocks.push(DownBlock::new(channels, out, vb.pp(format!("down_{}", i)))?);
            channels = out;
        }

        let head = conv2d(
            channels,
            config.embedding_dim,
            pyramid::BASE_SIZE,
            Conv2dConfig::default(),
            vb.pp("head"),
        )?;

        Ok(Self {
            blocks,
            head,
            config,
        })
    }

    /// Encode a batch of images
    ///
    /// # Arguments
    /// * `images` - `[batch, in_channels, image_size, image_size]`
    ///
    /// # Returns
    /// Embeddings of shape `[batch, embedding_dim]` with values in `[0, 1]`
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = images.clone();
        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }
        let x = self.head.forward(&x)?;
        candle_nn::ops::sigmoid(&x)?.flatten_from(1)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}
