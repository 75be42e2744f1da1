//! Volumetric discriminator with realism, identity and pose-code heads.
//!
//! A shared trunk of stride-2 3D convolutions (batch norm + leaky ReLU)
//! reduces the volume to a `4³` feature map. Three independent `4³`
//! convolutions then project it to one realism score, `n_id` identity
//! logits and `n_pcode` pose-code logits.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::conv3d::{conv3d_no_bias, Conv3d, Conv3dConfig};
use crate::generator::check_shape;
use crate::pyramid;

/// Negative slope of the trunk activations
pub const LEAKY_SLOPE: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Volume channels (1 or 4)
    pub in_channels: usize,
    /// Input grid size `S`, `4 · 2^k`
    pub resolution: usize,
    /// Width of the first stage
    pub base_channels: usize,
    pub max_channels: usize,
    pub n_id: usize,
    pub n_pcode: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            resolution: 64,
            base_channels: 32,
            max_channels: 512,
            n_id: 105,
            n_pcode: 48,
        }
    }
}

struct DownBlock {
    conv: Conv3d,
    norm: BatchNorm,
}

impl DownBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.norm.forward_t(&x, train)?;
        candle_nn::ops::leaky_relu(&x, LEAKY_SLOPE)
    }
}

/// The three discriminator outputs for a batch
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// `[B]`, in `[0, 1]`
    pub realism: Tensor,
    /// `[B, n_id]` raw class scores
    pub identity_logits: Tensor,
    /// `[B, n_pcode]` raw class scores
    pub pcode_logits: Tensor,
}

pub struct Discriminator {
    trunk: Vec<DownBlock>,
    realism_head: Conv3d,
    identity_head: Conv3d,
    pcode_head: Conv3d,
    config: DiscriminatorConfig,
}

impl Discriminator {
    pub fn new(config: DiscriminatorConfig, vb: VarBuilder) -> facevox_core::Result<Self> {
        let depth = pyramid::depth(config.resolution, "discriminator resolution")?;

        let downsample = Conv3dConfig { padding: 1, stride: 2 };
        let mut trunk = Vec::with_capacity(depth);
        let mut channels = config.in_channels;
        for i in 0..depth {
            let out = pyramid::widen(config.base_channels, i, config.max_channels);
            let vb = vb.pp(format!("down_{}", i));
            trunk.push(DownBlock {
                conv: conv3d_no_bias(channels, out, 4, downsample, vb.pp("conv"))?,
                norm: batch_norm(out, 1e-5, vb.pp("norm"))?,
            });
            channels = out;
        }

        let head = |width: usize, name: &str| {
            conv3d_no_bias(channels, width, pyramid::BASE_SIZE, Conv3dConfig::default(), vb.pp(name))
        };
        let realism_head = head(1, "realism")?;
        let identity_head = head(config.n_id, "identity")?;
        let pcode_head = head(config.n_pcode, "pcode")?;

        Ok(Self {
            trunk,
            realism_head,
            identity_head,
            pcode_head,
            config,
        })
    }

    /// Score a batch of volumes `[B, in_channels, S, S, S]`.
    pub fn discriminate(&self, volumes: &Tensor, train: bool) -> facevox_core::Result<DiscriminatorOutput> {
        let c = &self.config;
        let batch = volumes.dims().first().copied().unwrap_or(0);
        check_shape(
            "discriminator input",
            volumes,
            &[batch, c.in_channels, c.resolution, c.resolution, c.resolution],
        )?;
        Ok(self.forward_t(volumes, train)?)
    }

    /// Unchecked forward pass
    pub fn forward_t(&self, volumes: &Tensor, train: bool) -> Result<DiscriminatorOutput> {
        let mut x = volumes.clone();
        for block in &self.trunk {
            x = block.forward_t(&x, train)?;
        }

        let realism = candle_nn::ops::sigmoid(&self.realism_head.forward(&x)?)?.flatten_all()?;
        let identity_logits = self.identity_head.forward(&x)?.flatten_from(1)?;
        let pcode_logits = self.pcode_head.forward(&x)?.flatten_from(1)?;

        Ok(DiscriminatorOutput {
            realism,
            identity_logits,
            pcode_logits,
        })
    }

    /// Realism scores only, for penalty evaluation
    pub fn realism(&self, volumes: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.forward_t(volumes, train)?.realism)
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}
