//! Fundamental types shared by the rasterizer, the networks and the trainer.

use std::fmt;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Spatial axis of a scan or voxel grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        f.write_str(name)
    }
}

/// The two adversarial networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Generator,
    Discriminator,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Generator => f.write_str("generator"),
            Network::Discriminator => f.write_str("discriminator"),
        }
    }
}

/// One scanned surface point with texture coordinates into the companion photo
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub position: Point3<f64>,
    /// Normalized (u, v) texture coordinates in [0, 1]
    pub uv: Point2<f64>,
}

impl ScanPoint {
    pub fn new(x: f64, y: f64, z: f64, u: f64, v: f64) -> Self {
        Self {
            position: Point3::new(x, y, z),
            uv: Point2::new(u, v),
        }
    }

    /// Build from an `(x, y, z, u, v)` row
    pub fn from_row(row: [f64; 5]) -> Self {
        Self::new(row[0], row[1], row[2], row[3], row[4])
    }
}

/// Ordered point set produced by a face scanner.
///
/// Order matters: when two points fall into the same voxel the later one wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointSample {
    pub points: Vec<ScanPoint>,
}

impl PointSample {
    pub fn new(points: Vec<ScanPoint>) -> Self {
        Self { points }
    }

    pub fn from_rows(rows: &[[f64; 5]]) -> Self {
        Self {
            points: rows.iter().copied().map(ScanPoint::from_row).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScanPoint> {
        self.points.iter()
    }

    /// Multiply every coordinate by `factor`, leaving texture coordinates untouched
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| ScanPoint {
                    position: Point3::from(p.position.coords * factor),
                    uv: p.uv,
                })
                .collect(),
        }
    }
}

/// Per-sample supervision labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSet {
    /// Identity class index in `[0, n_id)`
    pub id: usize,
    /// Pose/expression code index in `[0, n_pcode)`
    pub pcode: usize,
    /// Coarse pose class, when the dataset provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pclass: Option<usize>,
}

impl LabelSet {
    pub fn new(id: usize, pcode: usize) -> Self {
        Self {
            id,
            pcode,
            pclass: None,
        }
    }

    pub fn with_pclass(mut self, pclass: usize) -> Self {
        self.pclass = Some(pclass);
        self
    }
}

/// Dataset-wide normalization constants for the distance-preservation term
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub mean_2d: f64,
    pub stddev_2d: f64,
    pub mean_volume: f64,
    pub stddev_volume: f64,
}

impl NormalizationStats {
    /// Statistics that leave distances unscaled
    pub fn identity() -> Self {
        Self {
            mean_2d: 0.0,
            stddev_2d: 1.0,
            mean_volume: 0.0,
            stddev_volume: 1.0,
        }
    }
}

impl Default for NormalizationStats {
    fn default() -> Self {
        Self::identity()
    }
}
