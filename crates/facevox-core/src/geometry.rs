//! Bounding-box geometry for fitting scans into a cubic grid.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Axis, PointSample};

/// Axis-aligned bounding box of a point sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl BoundingBox {
    /// Compute the bounds of all finite coordinates in `sample`.
    ///
    /// Fails with `DegenerateGeometry` when the sample is empty or when any
    /// axis has zero (or non-finite) extent.
    pub fn of(sample: &PointSample) -> Result<Self> {
        let mut min = Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
        let mut max = Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);

        for point in sample.iter() {
            for axis in 0..3 {
                let c = point.position[axis];
                // f64::min/max ignore NaN, so a corrupt point cannot poison the bounds
                min[axis] = min[axis].min(c);
                max[axis] = max[axis].max(c);
            }
        }

        let bounds = Self { min, max };
        let extent = bounds.extent();
        for axis in Axis::ALL {
            let e = extent[axis.index()];
            if !(e.is_finite() && e > 0.0) {
                return Err(Error::DegenerateGeometry { axis });
            }
        }

        Ok(bounds)
    }

    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Uniform scale that fits the longest-constrained axis into `resolution` cells.
    ///
    /// The per-axis ratio is `(resolution - 1) / extent`; the smallest one is
    /// applied to all three axes so the aspect ratio is preserved.
    pub fn uniform_ratio(&self, resolution: usize) -> f64 {
        let span = resolution.saturating_sub(1) as f64;
        let extent = self.extent();
        (span / extent.x).min(span / extent.y).min(span / extent.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_and_center() {
        let sample = PointSample::from_rows(&[
            [0.0, -1.0, 2.0, 0.0, 0.0],
            [4.0, 1.0, 10.0, 0.0, 0.0],
            [2.0, 0.0, 6.0, 0.0, 0.0],
        ]);
        let bounds = BoundingBox::of(&sample).unwrap();
        assert_eq!(bounds.min, Point3::new(0.0, -1.0, 2.0));
        assert_eq!(bounds.max, Point3::new(4.0, 1.0, 10.0));
        assert_eq!(bounds.center(), Point3::new(2.0, 0.0, 6.0));
    }

    #[test]
    fn test_uniform_ratio_uses_tightest_axis() {
        let sample = PointSample::from_rows(&[[0.0, 0.0, 0.0, 0.0, 0.0], [7.0, 14.0, 3.5, 0.0, 0.0]]);
        let bounds = BoundingBox::of(&sample).unwrap();
        // (8 - 1) / 14 on the y axis is the smallest ratio
        assert!((bounds.uniform_ratio(8) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_flat_cloud_is_degenerate() {
        let sample = PointSample::from_rows(&[[1.0, 0.0, 0.0, 0.0, 0.0], [1.0, 2.0, 3.0, 0.0, 0.0]]);
        match BoundingBox::of(&sample) {
            Err(Error::DegenerateGeometry { axis }) => assert_eq!(axis, Axis::X),
            other => panic!("expected degenerate geometry, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_cloud_is_degenerate() {
        assert!(matches!(
            BoundingBox::of(&PointSample::default()),
            Err(Error::DegenerateGeometry { .. })
        ));
    }
}
