//! Dense voxel volumes.

use ndarray::Array4;

/// Occupancy channel index
pub const OCCUPANCY: usize = 0;

/// A `(channels, S, S, S)` grid with values in `[0, 1]`.
///
/// Channel 0 holds occupancy; when present, channels 1..=3 hold RGB color.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array4<f32>,
}

impl Volume {
    pub fn zeros(channels: usize, resolution: usize) -> Self {
        Self {
            data: Array4::zeros((channels, resolution, resolution, resolution)),
        }
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn resolution(&self) -> usize {
        self.data.dim().1
    }

    pub fn shape(&self) -> [usize; 4] {
        let (c, x, y, z) = self.data.dim();
        [c, x, y, z]
    }

    pub fn has_color(&self) -> bool {
        self.channels() >= 4
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut Array4<f32> {
        &mut self.data
    }

    pub fn occupancy(&self, cell: [usize; 3]) -> f32 {
        self.data[[OCCUPANCY, cell[0], cell[1], cell[2]]]
    }

    pub fn color(&self, cell: [usize; 3]) -> Option<[f32; 3]> {
        if !self.has_color() {
            return None;
        }
        let [x, y, z] = cell;
        Some([
            self.data[[1, x, y, z]],
            self.data[[2, x, y, z]],
            self.data[[3, x, y, z]],
        ])
    }

    /// Cells whose occupancy is set, in x-major order
    pub fn occupied_cells(&self) -> Vec<[usize; 3]> {
        let occupancy = self.data.index_axis(ndarray::Axis(0), OCCUPANCY);
        occupancy
            .indexed_iter()
            .filter(|(_, &v)| v > 0.0)
            .map(|((x, y, z), _)| [x, y, z])
            .collect()
    }

    pub fn occupied_count(&self) -> usize {
        self.data
            .index_axis(ndarray::Axis(0), OCCUPANCY)
            .iter()
            .filter(|&&v| v > 0.0)
            .count()
    }
}

impl From<Array4<f32>> for Volume {
    fn from(data: Array4<f32>) -> Self {
        Self { data }
    }
}
