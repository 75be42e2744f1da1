//! # Facevox-Voxel
//!
//! Turns face scans into dense voxel volumes.
//!
//! ## Pipeline
//!
//! 1. **Decoding**: read BNT scans into ordered point samples
//! 2. **Fitting**: compute the bounding box and a single uniform scale
//! 3. **Rasterization**: mark occupied cells, optionally sampling color from
//!    the companion photo

pub mod rasterizer;
pub mod scan;
pub mod volume;

pub use rasterizer::*;
pub use scan::*;
pub use volume::*;
