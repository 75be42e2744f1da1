//! Loss terms for adversarial volume reconstruction.
//!
//! Discriminator: `L_D = L_real + L_id + L_pcode + L_fake (+ L_gp)`
//!
//! Generator: `L_G = L_adv + L_id + L_pcode (+ L_recon) (+ L_dist)`

use candle_core::{DType, Device, Result, Tensor};
use facevox_core::NormalizationStats;
use serde::{Deserialize, Serialize};

/// Probabilities are clamped to `[PROB_EPS, 1 - PROB_EPS]` before taking logs
const PROB_EPS: f64 = 1e-7;

/// Binary cross-entropy between probabilities and a constant target
pub fn binary_cross_entropy(probs: &Tensor, target: f64) -> Result<Tensor> {
    let p = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    let pos = (p.log()? * target)?;
    let neg = (p.affine(-1.0, 1.0)?.log()? * (1.0 - target))?;
    (pos + neg)?.mean_all()?.neg()
}

/// Realism loss in either the standard or the Wasserstein form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdversarialLoss {
    wasserstein: bool,
}

impl AdversarialLoss {
    pub fn new(wasserstein: bool) -> Self {
        Self { wasserstein }
    }

    pub fn is_wasserstein(&self) -> bool {
        self.wasserstein
    }

    /// Loss pushing `scores` toward "real": BCE vs 1, or `-mean(score)`
    pub fn real(&self, scores: &Tensor) -> Result<Tensor> {
        if self.wasserstein {
            scores.mean_all()?.neg()
        } else {
            binary_cross_entropy(scores, 1.0)
        }
    }

    /// Generator realism term: BCE against "real" under either form
    pub fn generator(&self, scores: &Tensor) -> Result<Tensor> {
        binary_cross_entropy(scores, 1.0)
    }

    /// Loss pushing `scores` toward "fake": BCE vs 0, or `mean(score)`
    pub fn fake(&self, scores: &Tensor) -> Result<Tensor> {
        if self.wasserstein {
            scores.mean_all()
        } else {
            binary_cross_entropy(scores, 0.0)
        }
    }
}

/// Cross-entropy of raw logits `[B, N]` against class indices
pub fn classification_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    candle_nn::loss::cross_entropy(logits, targets)
}

/// Voxel-wise reconstruction criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reconstruction {
    /// Mean squared error
    Mse,
    /// Mean absolute error
    L1,
}

impl Reconstruction {
    pub fn loss(&self, generated: &Tensor, real: &Tensor) -> Result<Tensor> {
        match self {
            Reconstruction::Mse => candle_nn::loss::mse(generated, real),
            Reconstruction::L1 => (generated - real)?.abs()?.mean_all(),
        }
    }
}

/// Mean L1 distance over all ordered pairs of distinct samples.
///
/// Accumulates row by row in sample order. Zero for batches under two samples.
pub fn mean_pairwise_l1(batch: &Tensor) -> Result<Tensor> {
    let n = batch.dim(0)?;
    let flat = batch.flatten_from(1)?;
    if n < 2 {
        return Tensor::zeros((), flat.dtype(), flat.device());
    }

    let mut sum = Tensor::zeros((), flat.dtype(), flat.device())?;
    for i in 0..n {
        let row = flat.narrow(0, i, 1)?;
        // Self-pair contributes zero
        let dists = flat.broadcast_sub(&row)?.abs()?.sum(1)?;
        sum = (sum + dists.sum_all()?)?;
    }
    sum / (n * (n - 1)) as f64
}

/// Distance-preservation term.
///
/// Penalizes the gap between the normalized mean pairwise distance of the
/// input images and that of the generated volumes. A batch of identical
/// samples scores zero.
///
/// Only the standard deviations of `stats` enter the term; the dataset
/// means are deliberately not subtracted.
pub fn distance_preservation(images: &Tensor, volumes: &Tensor, stats: &NormalizationStats) -> Result<Tensor> {
    let input = (mean_pairwise_l1(images)? / stats.stddev_2d)?;
    let output = (mean_pairwise_l1(volumes)? / stats.stddev_volume)?;
    (input - output)?.abs()
}

/// Fraction of reals scored above 0.5 plus fakes scored below 0.5
pub fn discriminator_accuracy(real_scores: &Tensor, fake_scores: &Tensor) -> Result<f32> {
    let real: Vec<f32> = real_scores.flatten_all()?.to_vec1()?;
    let fake: Vec<f32> = fake_scores.flatten_all()?.to_vec1()?;
    let total = real.len() + fake.len();
    if total == 0 {
        return Ok(0.0);
    }
    let correct = real.iter().filter(|&&s| s > 0.5).count() + fake.iter().filter(|&&s| s < 0.5).count();
    Ok(correct as f32 / total as f32)
}

/// One-hot encoding of class indices into `[B, width]`
pub fn one_hot(indices: &[usize], width: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f32; indices.len() * width];
    for (row, &index) in indices.iter().enumerate() {
        if index >= width {
            candle_core::bail!("class index {} out of range for width {}", index, width)
        }
        data[row * width + index] = 1.0;
    }
    Tensor::from_vec(data, (indices.len(), width), device)
}

/// Class indices as a `u32` target tensor
pub fn class_targets(indices: &[usize], device: &Device) -> Result<Tensor> {
    let data: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Tensor::from_vec(data, indices.len(), device)
}

/// Scalar loss value
pub fn scalar(loss: &Tensor) -> Result<f32> {
    loss.to_dtype(DType::F32)?.to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bce_matches_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let probs = Tensor::new(&[0.8f32, 0.6], &device)?;
        let real = scalar(&binary_cross_entropy(&probs, 1.0)?)?;
        let expected = -((0.8f32).ln() + (0.6f32).ln()) / 2.0;
        assert!((real - expected).abs() < 1e-5);

        let fake = scalar(&binary_cross_entropy(&probs, 0.0)?)?;
        let expected = -((0.2f32).ln() + (0.4f32).ln()) / 2.0;
        assert!((fake - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_bce_is_finite_at_saturation() -> Result<()> {
        let device = Device::Cpu;
        let probs = Tensor::new(&[0.0f32, 1.0], &device)?;
        assert!(scalar(&binary_cross_entropy(&probs, 1.0)?)?.is_finite());
        assert!(scalar(&binary_cross_entropy(&probs, 0.0)?)?.is_finite());
        Ok(())
    }

    #[test]
    fn test_wasserstein_signs() -> Result<()> {
        let device = Device::Cpu;
        let scores = Tensor::new(&[0.2f32, 0.4], &device)?;
        let loss = AdversarialLoss::new(true);
        assert!((scalar(&loss.real(&scores)?)? + 0.3).abs() < 1e-6);
        assert!((scalar(&loss.fake(&scores)?)? - 0.3).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_generator_term_is_bce_in_both_forms() -> Result<()> {
        let device = Device::Cpu;
        let scores = Tensor::new(&[0.2f32, 0.4], &device)?;
        let expected = -(0.2f64.ln() + 0.4f64.ln()) / 2.0;
        for wasserstein in [false, true] {
            let loss = AdversarialLoss::new(wasserstein).generator(&scores)?;
            assert!((f64::from(scalar(&loss)?) - expected).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_reconstruction_criteria() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::new(&[0.0f32, 1.0, 0.5, 0.5], &device)?;
        let b = Tensor::new(&[1.0f32, 1.0, 0.0, 0.5], &device)?;
        assert!((scalar(&Reconstruction::Mse.loss(&a, &b)?)? - 0.3125).abs() < 1e-6);
        assert!((scalar(&Reconstruction::L1.loss(&a, &b)?)? - 0.375).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_pairwise_l1_over_ordered_pairs() -> Result<()> {
        let device = Device::Cpu;
        // Distances: |0-1|=1, |0-3|=3, |1-3|=2, each counted twice over 6 pairs
        let batch = Tensor::new(&[[0f32], [1.0], [3.0]], &device)?;
        assert!((scalar(&mean_pairwise_l1(&batch)?)? - 2.0).abs() < 1e-6);

        let single = Tensor::new(&[[5f32, 1.0]], &device)?;
        assert_eq!(scalar(&mean_pairwise_l1(&single)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_distance_preservation_zero_for_identical_samples() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::rand(0f32, 1.0, (1, 3, 8, 8), &device)?;
        let volume = Tensor::rand(0f32, 1.0, (1, 1, 4, 4, 4), &device)?;
        let images = Tensor::cat(&[&image, &image, &image], 0)?;
        let volumes = Tensor::cat(&[&volume, &volume, &volume], 0)?;

        let stats = NormalizationStats {
            mean_2d: 12.0,
            stddev_2d: 3.0,
            mean_volume: 20.0,
            stddev_volume: 5.0,
        };
        let term = scalar(&distance_preservation(&images, &volumes, &stats)?)?;
        assert!(term.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_discriminator_accuracy() -> Result<()> {
        let device = Device::Cpu;
        let real = Tensor::new(&[0.9f32, 0.3], &device)?;
        let fake = Tensor::new(&[0.1f32, 0.2], &device)?;
        assert!((discriminator_accuracy(&real, &fake)? - 0.75).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_one_hot_rows() -> Result<()> {
        let device = Device::Cpu;
        let encoded = one_hot(&[1, 0], 3, &device)?;
        assert_eq!(encoded.to_vec2::<f32>()?, vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]]);
        for row in encoded.sum(1)?.to_vec1::<f32>()? {
            assert_eq!(row, 1.0);
        }
        assert!(one_hot(&[3], 3, &device).is_err());
        Ok(())
    }

    #[test]
    fn test_cross_entropy_prefers_correct_class() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[4f32, 0.0, 0.0]], &device)?;
        let right = scalar(&classification_loss(&logits, &class_targets(&[0], &device)?)?)?;
        let wrong = scalar(&classification_loss(&logits, &class_targets(&[2], &device)?)?)?;
        assert!(right < wrong);
        Ok(())
    }
}
