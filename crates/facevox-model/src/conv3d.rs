//! Volumetric convolutions built from 2D primitives.
//!
//! A 3D convolution is the sum over kernel depth of 2D convolutions applied
//! to strided depth slices of the input. A transposed 3D convolution is a
//! stride-1 3D convolution over the zero-dilated input, with the kernel
//! stored directly in convolution layout `[out, in, k, k, k]`.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Padding and stride shared by all three spatial axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv3dConfig {
    pub padding: usize,
    pub stride: usize,
}

impl Default for Conv3dConfig {
    fn default() -> Self {
        Self { padding: 0, stride: 1 }
    }
}

/// Xavier-uniform initializer for a cubic kernel
fn xavier_uniform(in_channels: usize, out_channels: usize, kernel_size: usize) -> Init {
    let volume = kernel_size.pow(3);
    let fan_in = in_channels * volume;
    let fan_out = out_channels * volume;
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Raw 3D convolution over `[B, C, D, H, W]` input.
pub fn conv3d_raw(
    xs: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    config: Conv3dConfig,
) -> Result<Tensor> {
    let (b, c, d, h, w) = xs.dims5()?;
    let (o, c_k, kd, _, _) = weight.dims5()?;
    if c != c_k {
        bail!("conv3d: input has {} channels, kernel expects {}", c, c_k)
    }
    if config.stride == 0 {
        bail!("conv3d: stride must be positive")
    }

    let padding = config.padding;
    // index_select needs a contiguous layout
    let xs = if padding > 0 {
        xs.pad_with_zeros(2, padding, padding)?.contiguous()?
    } else {
        xs.contiguous()?
    };
    let d_padded = d + 2 * padding;
    if kd == 0 || d_padded < kd {
        bail!("conv3d: kernel depth {} does not fit padded depth {}", kd, d_padded)
    }
    let d_out = (d_padded - kd) / config.stride + 1;

    let mut acc: Option<Tensor> = None;
    for k in 0..kd {
        let index: Vec<u32> = (0..d_out).map(|i| (i * config.stride + k) as u32).collect();
        let index = Tensor::new(index.as_slice(), xs.device())?;

        // [B, C, D', H, W] -> [B·D', C, H, W]
        let slices = xs
            .index_select(&index, 2)?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?
            .reshape((b * d_out, c, h, w))?;
        let kernel = weight.narrow(2, k, 1)?.squeeze(2)?.contiguous()?;
        let ys = slices.conv2d(&kernel, padding, config.stride, 1, 1)?;

        acc = Some(match acc {
            Some(sum) => (sum + ys)?,
            None => ys,
        });
    }

    let ys = match acc {
        Some(ys) => ys,
        None => bail!("conv3d: empty kernel"),
    };
    let (_, _, h_out, w_out) = ys.dims4()?;
    let ys = ys
        .reshape((b, d_out, o, h_out, w_out))?
        .permute((0, 2, 1, 3, 4))?
        .contiguous()?;

    match bias {
        Some(bias) => ys.broadcast_add(&bias.reshape((1, o, 1, 1, 1))?),
        None => Ok(ys),
    }
}

/// Insert `stride - 1` zeros between neighbouring elements along `dim`
fn dilate(xs: &Tensor, dim: usize, stride: usize) -> Result<Tensor> {
    let n = xs.dim(dim)?;
    if stride <= 1 || n <= 1 {
        return Ok(xs.clone());
    }
    let expanded = xs.unsqueeze(dim + 1)?;
    let mut zero_shape = expanded.dims().to_vec();
    zero_shape[dim + 1] = stride - 1;
    let zeros = Tensor::zeros(zero_shape, xs.dtype(), xs.device())?;

    let mut dims = xs.dims().to_vec();
    dims[dim] = n * stride;
    Tensor::cat(&[&expanded, &zeros], dim + 1)?
        .reshape(dims)?
        .narrow(dim, 0, (n - 1) * stride + 1)?
        .contiguous()
}

#[derive(Debug, Clone)]
pub struct Conv3d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: Conv3dConfig,
}

impl Conv3d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv3dConfig) -> Self {
        Self {
            weight,
            bias,
            config,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn config(&self) -> &Conv3dConfig {
        &self.config
    }
}

impl Module for Conv3d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        conv3d_raw(xs, &self.weight, self.bias.as_ref(), self.config)
    }
}

/// Transposed 3D convolution.
///
/// Output size per axis is `(n - 1) · stride - 2 · padding + kernel`.
#[derive(Debug, Clone)]
pub struct ConvTranspose3d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: Conv3dConfig,
}

impl ConvTranspose3d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv3dConfig) -> Self {
        Self {
            weight,
            bias,
            config,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for ConvTranspose3d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let kernel_size = self.weight.dim(2)?;
        if self.config.padding + 1 > kernel_size {
            bail!(
                "conv_transpose3d: padding {} must be below kernel size {}",
                self.config.padding,
                kernel_size
            )
        }
        let mut xs = xs.clone();
        for dim in 2..5 {
            xs = dilate(&xs, dim, self.config.stride)?;
        }
        let inner = Conv3dConfig {
            padding: kernel_size - 1 - self.config.padding,
            stride: 1,
        };
        conv3d_raw(&xs, &self.weight, self.bias.as_ref(), inner)
    }
}

fn kernel(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    vb: &VarBuilder,
) -> Result<Tensor> {
    vb.get_with_hints(
        (out_channels, in_channels, kernel_size, kernel_size, kernel_size),
        "weight",
        xavier_uniform(in_channels, out_channels, kernel_size),
    )
}

pub fn conv3d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv3dConfig,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let weight = kernel(in_channels, out_channels, kernel_size, &vb)?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
    Ok(Conv3d::new(weight, Some(bias), config))
}

pub fn conv3d_no_bias(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv3dConfig,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let weight = kernel(in_channels, out_channels, kernel_size, &vb)?;
    Ok(Conv3d::new(weight, None, config))
}

pub fn conv_transpose3d_no_bias(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv3dConfig,
    vb: VarBuilder,
) -> Result<ConvTranspose3d> {
    let weight = kernel(in_channels, out_channels, kernel_size, &vb)?;
    Ok(ConvTranspose3d::new(weight, None, config))
}
