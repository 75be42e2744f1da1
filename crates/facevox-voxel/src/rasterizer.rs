//! Point-cloud to voxel rasterization.
//!
//! A scan is fitted into an `S × S × S` grid with a single uniform scale
//! (the aspect ratio of the face is never distorted). Each point marks the
//! occupancy of the cell it falls in and, when a companion photo is given,
//! writes the color sampled at its texture coordinates into channels 1..=3.
//!
//! Collisions are resolved last-write-wins, so the output depends on point
//! order.

use facevox_core::{BoundingBox, Error, PointSample, Result};
use image::Rgb32FImage;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::volume::{Volume, OCCUPANCY};

/// Rasterization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterConfig {
    /// Edge length `S` of the cubic grid
    pub resolution: usize,
    /// Center the scan in the grid instead of anchoring it at the origin corner
    pub center: bool,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            resolution: 64,
            center: true,
        }
    }
}

/// Converts scans into fixed-size volumes
#[derive(Debug, Clone)]
pub struct Rasterizer {
    config: RasterConfig,
}

impl Rasterizer {
    pub fn new(config: RasterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RasterConfig {
        &self.config
    }

    /// Rasterize one scan.
    ///
    /// Returns a 1-channel occupancy volume, or a 4-channel occupancy + RGB
    /// volume when `color_image` is supplied. Points whose cell falls outside
    /// the grid are logged and skipped.
    pub fn rasterize(&self, points: &PointSample, color_image: Option<&Rgb32FImage>) -> Result<Volume> {
        let resolution = self.config.resolution;
        if resolution == 0 {
            return Err(Error::InvalidInput("voxel resolution must be positive".to_string()));
        }

        let bounds = BoundingBox::of(points)?;
        let ratio = bounds.uniform_ratio(resolution);
        let projection = Projection::new(&bounds, ratio, resolution, self.config.center);

        let channels = if color_image.is_some() { 4 } else { 1 };
        let mut volume = Volume::zeros(channels, resolution);
        let mut skipped = 0usize;

        for (index, point) in points.iter().enumerate() {
            let [x, y, z] = match projection.cell(index, &point.position) {
                Ok(cell) => cell,
                Err(err) => {
                    tracing::warn!("{}", err);
                    skipped += 1;
                    continue;
                }
            };

            let data = volume.data_mut();
            data[[OCCUPANCY, x, y, z]] = 1.0;

            if let Some(image) = color_image {
                let [r, g, b] = sample_nearest(image, point.uv.x, point.uv.y);
                data[[1, x, y, z]] = r;
                data[[2, x, y, z]] = g;
                data[[3, x, y, z]] = b;
            }
        }

        if skipped > 0 {
            tracing::debug!(
                skipped,
                total = points.len(),
                "rasterization finished with out-of-grid points"
            );
        }

        Ok(volume)
    }

    /// Rasterize several scans, isolating failures per scan.
    ///
    /// A degenerate scan yields an `Err` in its own slot and leaves the other
    /// volumes untouched.
    pub fn rasterize_batch<'a, I>(&self, scans: I) -> Vec<Result<Volume>>
    where
        I: IntoIterator<Item = (&'a PointSample, Option<&'a Rgb32FImage>)>,
    {
        scans
            .into_iter()
            .map(|(points, image)| self.rasterize(points, image))
            .collect()
    }
}

/// Rasterize `points` into a `resolution³` grid.
pub fn rasterize(
    points: &PointSample,
    resolution: usize,
    center: bool,
    color_image: Option<&Rgb32FImage>,
) -> Result<Volume> {
    Rasterizer::new(RasterConfig { resolution, center }).rasterize(points, color_image)
}

/// Maps scan coordinates to integer cell indices
struct Projection {
    origin: Point3<f64>,
    ratio: f64,
    offset: f64,
    resolution: usize,
}

impl Projection {
    fn new(bounds: &BoundingBox, ratio: f64, resolution: usize, center: bool) -> Self {
        let (origin, offset) = if center {
            (bounds.center(), (resolution / 2) as f64)
        } else {
            (bounds.min, 0.0)
        };
        Self {
            origin,
            ratio,
            offset,
            resolution,
        }
    }

    fn cell(&self, index: usize, position: &Point3<f64>) -> Result<[usize; 3]> {
        let mut raw = [0.0f64; 3];
        for (axis, slot) in raw.iter_mut().enumerate() {
            *slot = ((position[axis] - self.origin[axis]) * self.ratio + self.offset).floor();
        }

        let limit = self.resolution as f64;
        if raw.iter().all(|c| c.is_finite() && *c >= 0.0 && *c < limit) {
            Ok([raw[0] as usize, raw[1] as usize, raw[2] as usize])
        } else {
            Err(Error::PerPointProjectionOverflow {
                index,
                cell: [raw[0] as i64, raw[1] as i64, raw[2] as i64],
                resolution: self.resolution,
            })
        }
    }
}

/// Nearest-pixel lookup at row `v · height`, column `u · width`
fn sample_nearest(image: &Rgb32FImage, u: f64, v: f64) -> [f32; 3] {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return [0.0; 3];
    }
    let col = ((u * width as f64).floor().max(0.0) as u32).min(width - 1);
    let row = ((v * height as f64).floor().max(0.0) as u32).min(height - 1);
    let pixel = image.get_pixel(col, row).0;
    [
        pixel[0].clamp(0.0, 1.0),
        pixel[1].clamp(0.0, 1.0),
        pixel[2].clamp(0.0, 1.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use facevox_core::{Axis, ScanPoint};
    use image::Rgb;
    use proptest::prelude::*;

    fn cube_corners() -> PointSample {
        let mut rows = Vec::new();
        for &x in &[0.0, 1.0] {
            for &y in &[0.0, 1.0] {
                for &z in &[0.0, 1.0] {
                    rows.push([x, y, z, 0.5, 0.5]);
                }
            }
        }
        PointSample::from_rows(&rows)
    }

    /// 2x1 image: left pixel red, right pixel blue
    fn two_color_image() -> Rgb32FImage {
        let mut image = Rgb32FImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([1.0, 0.0, 0.0]));
        image.put_pixel(1, 0, Rgb([0.0, 0.0, 1.0]));
        image
    }

    #[test]
    fn test_corner_anchored_cube_fills_grid_corners() {
        let volume = rasterize(&cube_corners(), 8, false, None).unwrap();
        assert_eq!(volume.shape(), [1, 8, 8, 8]);
        assert_eq!(volume.occupied_count(), 8);
        assert_eq!(volume.occupancy([0, 0, 0]), 1.0);
        assert_eq!(volume.occupancy([7, 7, 7]), 1.0);
        assert_eq!(volume.occupancy([7, 0, 7]), 1.0);
    }

    #[test]
    fn test_centered_cube_stays_inside_grid() {
        let volume = rasterize(&cube_corners(), 8, true, None).unwrap();
        // midpoint 0.5, ratio 7: (0 - 0.5) * 7 + 4 = 0.5 and (1 - 0.5) * 7 + 4 = 7.5
        assert_eq!(volume.occupancy([0, 0, 0]), 1.0);
        assert_eq!(volume.occupancy([7, 7, 7]), 1.0);
        assert_eq!(volume.occupied_count(), 8);
    }

    #[test]
    fn test_uniform_ratio_preserves_aspect() {
        // x spans 2 units, y and z span 1: the x axis limits the ratio
        let points = PointSample::from_rows(&[
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [2.0, 1.0, 1.0, 0.0, 0.0],
        ]);
        let volume = rasterize(&points, 9, false, None).unwrap();
        // ratio = 8 / 2 = 4, so the far corner lands at (8, 4, 4)
        assert_eq!(volume.occupancy([8, 4, 4]), 1.0);
    }

    #[test]
    fn test_color_written_from_texture_coordinates() {
        let points = PointSample::new(vec![
            ScanPoint::new(0.0, 0.0, 0.0, 0.1, 0.0),
            ScanPoint::new(1.0, 1.0, 1.0, 0.9, 0.0),
        ]);
        let volume = rasterize(&points, 4, false, Some(&two_color_image())).unwrap();
        assert_eq!(volume.shape(), [4, 4, 4, 4]);
        assert_eq!(volume.color([0, 0, 0]), Some([1.0, 0.0, 0.0]));
        assert_eq!(volume.color([3, 3, 3]), Some([0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_collision_last_write_wins_in_both_orders() {
        // The first two points share a cell but sample different pixels
        let red = ScanPoint::new(0.0, 0.0, 0.0, 0.0, 0.0);
        let blue = ScanPoint::new(0.01, 0.01, 0.01, 0.99, 0.0);
        let anchor = ScanPoint::new(1.0, 1.0, 1.0, 0.0, 0.0);
        let image = two_color_image();

        let red_then_blue = PointSample::new(vec![red, blue, anchor]);
        let volume = rasterize(&red_then_blue, 4, false, Some(&image)).unwrap();
        assert_eq!(volume.color([0, 0, 0]), Some([0.0, 0.0, 1.0]));

        let blue_then_red = PointSample::new(vec![blue, red, anchor]);
        let volume = rasterize(&blue_then_red, 4, false, Some(&image)).unwrap();
        assert_eq!(volume.color([0, 0, 0]), Some([1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_shared_x_coordinate_is_degenerate() {
        let points = PointSample::from_rows(&[
            [3.0, 0.0, 0.0, 0.0, 0.0],
            [3.0, 1.0, 2.0, 0.0, 0.0],
            [3.0, 5.0, 1.0, 0.0, 0.0],
        ]);
        match rasterize(&points, 8, true, None) {
            Err(Error::DegenerateGeometry { axis }) => assert_eq!(axis, Axis::X),
            other => panic!("expected DegenerateGeometry, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_point_is_skipped() {
        let mut points = cube_corners();
        points.points.insert(3, ScanPoint::new(f64::NAN, 0.5, 0.5, 0.0, 0.0));
        let volume = rasterize(&points, 8, false, None).unwrap();
        assert_eq!(volume.occupied_count(), 8);
    }

    #[test]
    fn test_batch_isolates_degenerate_scan() {
        let good = cube_corners();
        let flat = PointSample::from_rows(&[[0.0, 0.0, 1.0, 0.0, 0.0], [1.0, 1.0, 1.0, 0.0, 0.0]]);
        let rasterizer = Rasterizer::new(RasterConfig {
            resolution: 8,
            center: false,
        });
        let results = rasterizer.rasterize_batch(vec![(&good, None), (&flat, None), (&good, None)]);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::DegenerateGeometry { axis: Axis::Z })));
        assert_eq!(results[2].as_ref().unwrap().occupied_count(), 8);
    }

    fn point_cloud() -> impl Strategy<Value = Vec<[f64; 5]>> {
        prop::collection::vec(
            (-50.0f64..50.0, -50.0f64..50.0, -50.0f64..50.0, 0.0f64..1.0, 0.0f64..1.0)
                .prop_map(|(x, y, z, u, v)| [x, y, z, u, v]),
            4..200,
        )
    }

    proptest! {
        #[test]
        fn prop_shape_and_range_invariant(
            rows in point_cloud(),
            resolution in 1usize..24,
            center in any::<bool>(),
            with_color in any::<bool>(),
        ) {
            let points = PointSample::from_rows(&rows);
            let image = Rgb32FImage::from_fn(5, 3, |x, y| Rgb([x as f32 / 4.0, y as f32 / 2.0, 0.5]));
            let color = if with_color { Some(&image) } else { None };
            match rasterize(&points, resolution, center, color) {
                Ok(volume) => {
                    let channels = if with_color { 4 } else { 1 };
                    prop_assert_eq!(volume.shape(), [channels, resolution, resolution, resolution]);
                    prop_assert!(volume.data().iter().all(|v| (0.0..=1.0).contains(v)));
                }
                // Random clouds can collapse onto a plane only with vanishing probability
                Err(Error::DegenerateGeometry { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_uniform_scale_invariance(
            rows in point_cloud(),
            factor in 0.25f64..8.0,
            resolution in 4usize..32,
        ) {
            let points = PointSample::from_rows(&rows);
            let base = rasterize(&points, resolution, false, None);
            prop_assume!(base.is_ok());
            let base = base.unwrap();
            let scaled = rasterize(&points.scaled(factor), resolution, false, None).unwrap();

            let base_cells = base.occupied_cells();
            let scaled_cells = scaled.occupied_cells();
            let differing = base_cells.iter().filter(|c| !scaled_cells.contains(c)).count()
                + scaled_cells.iter().filter(|c| !base_cells.contains(c)).count();

            // Only cells sitting exactly on a rounding boundary may flip
            let tolerance = 2 + base_cells.len() / 20;
            prop_assert!(differing <= tolerance, "{} cells differ", differing);
        }
    }
}
