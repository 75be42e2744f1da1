//! Gradient penalties on interpolated volumes.
//!
//! candle only provides first-order gradients, so the gradient norm cannot
//! be differentiated with respect to the critic's parameters directly. The
//! penalty instead:
//!
//! 1. takes `g = ∇ₓ D(x̂)` by a first backward pass (detached),
//! 2. normalizes it to a unit direction `v` per sample,
//! 3. measures the directional derivative with a central difference
//!    `(D(x̂ + εv) - D(x̂ - εv)) / 2ε`, which equals `‖∇ₓ D(x̂)‖` to first
//!    order and stays differentiable in the critic's parameters.
//!
//! The penalty is `λ · mean((‖∇‖ - 1)²)`.

use candle_core::{Result, Tensor, Var};
use serde::{Deserialize, Serialize};

/// Penalty weight
pub const PENALTY_LAMBDA: f64 = 0.25;

/// Central-difference step
pub const DIFFERENCE_STEP: f64 = 1e-2;

/// Where the interpolant is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PenaltyKind {
    /// Between a real volume and the matching fake
    WassersteinGp,
    /// Between a real volume and a local perturbation of itself
    Dragan,
}

#[derive(Debug, Clone, Copy)]
pub struct GradientPenalty {
    kind: PenaltyKind,
    lambda: f64,
    step: f64,
}

impl GradientPenalty {
    pub fn new(kind: PenaltyKind) -> Self {
        Self {
            kind,
            lambda: PENALTY_LAMBDA,
            step: DIFFERENCE_STEP,
        }
    }

    pub fn kind(&self) -> PenaltyKind {
        self.kind
    }

    /// Build the interpolant `x̂` (detached from both inputs).
    ///
    /// The mixing coefficient is drawn uniformly per element.
    pub fn interpolate(&self, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
        let real = real.detach();
        let alpha = real.rand_like(0.0, 1.0)?;
        let other = match self.kind {
            PenaltyKind::WassersteinGp => fake.detach(),
            PenaltyKind::Dragan => perturb(&real)?,
        };
        let mixed = ((&alpha * &real)? + (alpha.affine(-1.0, 1.0)? * other)?)?;
        Ok(mixed.detach())
    }

    /// Penalty on the critic's gradient norm at `interpolant`.
    ///
    /// `critic` maps `[B, ...]` volumes to `[B]` scores.
    pub fn compute<F>(&self, interpolant: &Tensor, critic: F) -> Result<Tensor>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let direction = self.unit_gradient(interpolant, &critic)?;
        let step = (direction * self.step)?;

        let base = interpolant.detach();
        let ahead = critic(&(&base + &step)?)?;
        let behind = critic(&(&base - &step)?)?;
        let norm = ((ahead - behind)? / (2.0 * self.step))?;

        let deviation = (norm - 1.0)?.sqr()?.mean_all()?;
        deviation * self.lambda
    }

    /// Per-sample unit direction of `∇ₓ critic(x)`, zero where the gradient vanishes
    fn unit_gradient<F>(&self, interpolant: &Tensor, critic: &F) -> Result<Tensor>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let x = Var::from_tensor(&interpolant.detach())?;
        let scores = critic(x.as_tensor())?;
        let grads = scores.sum_all()?.backward()?;
        let gradient = match grads.get(x.as_tensor()) {
            Some(g) => g.detach(),
            None => return x.as_tensor().zeros_like(),
        };

        let batch = gradient.dim(0)?;
        let mut norm_shape = vec![1usize; gradient.rank()];
        norm_shape[0] = batch;
        let norm = gradient
            .flatten_from(1)?
            .sqr()?
            .sum(1)?
            .sqrt()?
            .reshape(norm_shape)?;
        gradient.broadcast_div(&(norm + 1e-12)?)
    }
}

/// `x + 0.5 · std(x) · U(0, 1)` with the standard deviation taken per sample
fn perturb(real: &Tensor) -> Result<Tensor> {
    let batch = real.dim(0)?;
    let flat = real.flatten_from(1)?;
    let n = flat.dim(1)?;
    let mean = flat.mean_keepdim(1)?;
    let var = (flat.broadcast_sub(&mean)?.sqr()?.sum_keepdim(1)? / (n.max(2) - 1) as f64)?;

    let mut std_shape = vec![1usize; real.rank()];
    std_shape[0] = batch;
    let std = var.sqrt()?.reshape(std_shape)?;

    let noise = real.rand_like(0.0, 1.0)?;
    real + noise.broadcast_mul(&(std * 0.5)?)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};

    #[test]
    fn test_linear_critic_with_unit_gradient_has_zero_penalty() -> Result<()> {
        let device = Device::Cpu;
        // score = <w, x> with ‖w‖ = 1 per sample
        let w = Tensor::new(&[0.6f32, 0.8, 0.0, 0.0], &device)?.reshape((1, 4))?;
        let critic = |x: &Tensor| x.broadcast_mul(&w)?.sum(D::Minus1);

        let x = Tensor::rand(0f32, 1.0, (3, 4), &device)?;
        let penalty = GradientPenalty::new(PenaltyKind::WassersteinGp).compute(&x, critic)?;
        assert!(penalty.to_scalar::<f32>()?.abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_penalty_tracks_gradient_norm() -> Result<()> {
        let device = Device::Cpu;
        // ‖∇‖ = 3 gives λ · (3 - 1)² = 1
        let w = Tensor::new(&[3f32, 0.0], &device)?.reshape((1, 2))?;
        let critic = |x: &Tensor| x.broadcast_mul(&w)?.sum(D::Minus1);

        let x = Tensor::rand(0f32, 1.0, (2, 2), &device)?;
        let penalty = GradientPenalty::new(PenaltyKind::Dragan).compute(&x, critic)?;
        assert!((penalty.to_scalar::<f32>()? - 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_penalty_is_differentiable_in_critic_parameters() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[[2f32, 1.0]], &device)?)?;
        let critic = |x: &Tensor| x.broadcast_mul(w.as_tensor())?.sum(D::Minus1);

        let x = Tensor::rand(0f32, 1.0, (2, 2), &device)?;
        let penalty = GradientPenalty::new(PenaltyKind::WassersteinGp).compute(&x, critic)?;
        let grads = penalty.backward()?;
        assert!(grads.get(w.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn test_interpolants_stay_between_endpoints() -> Result<()> {
        let device = Device::Cpu;
        let real = Tensor::ones((2, 1, 2, 2, 2), candle_core::DType::F32, &device)?;
        let fake = Tensor::zeros((2, 1, 2, 2, 2), candle_core::DType::F32, &device)?;

        let mixed = GradientPenalty::new(PenaltyKind::WassersteinGp).interpolate(&real, &fake)?;
        let values = mixed.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        // Constant samples have zero spread, so DRAGAN leaves them in place
        let mixed = GradientPenalty::new(PenaltyKind::Dragan).interpolate(&real, &fake)?;
        let values = mixed.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }
}
