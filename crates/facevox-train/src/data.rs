//! Mini-batch data sources.
//!
//! The trainer only sees the [`DataSource`] contract: a fixed number of
//! equally-sized batches per epoch plus dataset-wide distance statistics.
//! [`InMemoryDataset`] implements it over rasterized scans.

use candle_core::{Device, Tensor};
use facevox_core::{Error, LabelSet, NormalizationStats, PointSample, Result};
use facevox_voxel::{Rasterizer, Volume};
use image::{imageops, Rgb, Rgb32FImage};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// One mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, C, S, S, S]` real volumes
    pub volumes: Tensor,
    /// `[B, 3, H, W]` companion images
    pub images: Tensor,
    pub labels: Vec<LabelSet>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn ids(&self) -> Vec<usize> {
        self.labels.iter().map(|l| l.id).collect()
    }

    pub fn pcodes(&self) -> Vec<usize> {
        self.labels.iter().map(|l| l.pcode).collect()
    }
}

/// Source of training batches
pub trait DataSource {
    /// Complete batches per epoch
    fn num_batches(&self) -> usize;

    /// Batch `index` of `epoch`
    fn batch(&self, epoch: usize, index: usize) -> Result<Batch>;

    /// Distance statistics of the whole dataset
    fn normalization(&self) -> NormalizationStats;
}

/// A rasterized training sample
#[derive(Debug, Clone)]
pub struct Sample {
    pub volume: Volume,
    /// `(C, H, W)` network input
    pub image: Array3<f32>,
    pub labels: LabelSet,
}

/// A raw scan awaiting rasterization
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub points: PointSample,
    /// Photo sampled for voxel color, if any
    pub texture: Option<Rgb32FImage>,
    /// Network input image
    pub image: Rgb32FImage,
    pub labels: LabelSet,
}

/// Pad an image to a square with black borders, then resize to `size × size`
pub fn square_image(image: &Rgb32FImage, size: u32) -> Rgb32FImage {
    let (width, height) = image.dimensions();
    let side = width.max(height).max(1);
    let mut canvas = Rgb32FImage::from_pixel(side, side, Rgb([0.0, 0.0, 0.0]));
    let x = i64::from((side - width) / 2);
    let y = i64::from((side - height) / 2);
    imageops::overlay(&mut canvas, image, x, y);
    imageops::resize(&canvas, size, size, imageops::FilterType::Triangle)
}

/// `(3, H, W)` array from an RGB image
pub fn image_array(image: &Rgb32FImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        image.get_pixel(x as u32, y as u32).0[c]
    })
}

/// Pair count above which distance statistics are estimated from a sample
pub const MAX_STAT_PAIRS: usize = 4096;

/// L1 distance between two equally-shaped arrays
fn l1_distance<'a, I>(a: I, b: I) -> f64
where
    I: IntoIterator<Item = &'a f32>,
{
    a.into_iter().zip(b).map(|(x, y)| f64::from((x - y).abs())).sum()
}

/// Mean and population standard deviation of `distance` over pairs of `n` samples.
///
/// Every unordered pair is visited while there are at most
/// [`MAX_STAT_PAIRS`] of them; beyond that a seeded uniform sample of
/// `MAX_STAT_PAIRS` distinct-index pairs is used.
fn pair_distance_stats<F>(n: usize, seed: u64, distance: F) -> (f64, f64)
where
    F: Fn(usize, usize) -> f64,
{
    if n < 2 {
        return (0.0, 1.0);
    }
    let total = n * (n - 1) / 2;
    let distances: Vec<f64> = if total <= MAX_STAT_PAIRS {
        (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| distance(i, j))
            .collect()
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..MAX_STAT_PAIRS)
            .map(|_| {
                let i = rng.gen_range(0..n);
                let j = rng.gen_range(0..n - 1);
                distance(i, if j >= i { j + 1 } else { j })
            })
            .collect()
    };

    let count = distances.len() as f64;
    let mean = distances.iter().sum::<f64>() / count;
    let var = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / count;
    let std = var.sqrt();
    (mean, if std.is_finite() && std > 0.0 { std } else { 1.0 })
}

/// Dataset held entirely in memory
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    batch_size: usize,
    seed: u64,
    stats: NormalizationStats,
    device: Device,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>, batch_size: usize, seed: u64, device: Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".to_string()));
        }
        let first = samples
            .first()
            .ok_or_else(|| Error::InvalidInput("dataset has no samples".to_string()))?;
        let volume_shape = first.volume.shape();
        let image_shape = first.image.shape().to_vec();
        for sample in &samples {
            if sample.volume.shape() != volume_shape {
                return Err(Error::shape_mismatch("dataset volume", &volume_shape, &sample.volume.shape()));
            }
            if sample.image.shape() != image_shape.as_slice() {
                return Err(Error::shape_mismatch("dataset image", &image_shape, sample.image.shape()));
            }
        }

        let n = samples.len();
        let (mean_2d, stddev_2d) = pair_distance_stats(n, seed, |i, j| {
            l1_distance(samples[i].image.iter(), samples[j].image.iter())
        });
        let (mean_volume, stddev_volume) = pair_distance_stats(n, seed, |i, j| {
            l1_distance(samples[i].volume.data().iter(), samples[j].volume.data().iter())
        });
        let stats = NormalizationStats {
            mean_2d,
            stddev_2d,
            mean_volume,
            stddev_volume,
        };
        tracing::info!(
            samples = samples.len(),
            batch_size,
            mean_2d,
            stddev_2d,
            mean_volume,
            stddev_volume,
            "dataset ready"
        );

        Ok(Self {
            samples,
            batch_size,
            seed,
            stats,
            device,
        })
    }

    /// Rasterize scans and build a dataset.
    ///
    /// Scans with degenerate geometry are dropped with a warning; any other
    /// failure aborts.
    pub fn from_scans(
        scans: Vec<ScanRecord>,
        rasterizer: &Rasterizer,
        image_size: u32,
        batch_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        let volumes = rasterizer.rasterize_batch(scans.iter().map(|s| (&s.points, s.texture.as_ref())));

        let mut samples = Vec::with_capacity(scans.len());
        for (index, (scan, volume)) in scans.iter().zip(volumes).enumerate() {
            match volume {
                Ok(volume) => samples.push(Sample {
                    volume,
                    image: image_array(&square_image(&scan.image, image_size)),
                    labels: scan.labels,
                }),
                Err(err @ Error::DegenerateGeometry { .. }) => {
                    tracing::warn!(index, id = scan.labels.id, "skipping scan: {}", err);
                }
                Err(err) => return Err(err),
            }
        }

        Self::new(samples, batch_size, seed, device)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample order of `epoch`, reproducible from the seed
    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
        order
    }
}

impl DataSource for InMemoryDataset {
    fn num_batches(&self) -> usize {
        self.samples.len() / self.batch_size
    }

    fn batch(&self, epoch: usize, index: usize) -> Result<Batch> {
        if index >= self.num_batches() {
            return Err(Error::InvalidInput(format!(
                "batch {} out of range ({} complete batches)",
                index,
                self.num_batches()
            )));
        }
        let order = self.order(epoch);
        let picked = &order[index * self.batch_size..(index + 1) * self.batch_size];

        let [c, s, _, _] = self.samples[0].volume.shape();
        let (ic, ih, iw) = self.samples[0].image.dim();

        let mut volume_data = Vec::with_capacity(picked.len() * c * s * s * s);
        let mut image_data = Vec::with_capacity(picked.len() * ic * ih * iw);
        let mut labels = Vec::with_capacity(picked.len());
        for &i in picked {
            let sample = &self.samples[i];
            volume_data.extend(sample.volume.data().iter().copied());
            image_data.extend(sample.image.iter().copied());
            labels.push(sample.labels);
        }

        let b = picked.len();
        Ok(Batch {
            volumes: Tensor::from_vec(volume_data, (b, c, s, s, s), &self.device)?,
            images: Tensor::from_vec(image_data, (b, ic, ih, iw), &self.device)?,
            labels,
        })
    }

    fn normalization(&self) -> NormalizationStats {
        self.stats
    }
}
