//! # Facevox-Model
//!
//! Neural networks that reconstruct a face volume from a single photograph.
//!
//! ## Architecture Overview
//!
//! 1. **Identity Encoder**: strided 2D convolution pyramid, image → bounded embedding
//! 2. **Conditional Decoder**: embedding ⊕ one-hot pose/expression code ⊕ noise →
//!    linear projection → transposed 3D convolution pyramid → volume
//! 3. **Discriminator**: strided 3D convolution trunk with realism, identity and
//!    pose-code heads
//!
//! The adversarial objective combines realism, classification, reconstruction
//! and distance-preservation terms, optionally regularized by a gradient
//! penalty on interpolated volumes.

pub mod conv3d;
pub mod decoder;
pub mod discriminator;
pub mod encoder;
pub mod generator;
pub mod inference;
pub mod loss;
pub mod penalty;
pub mod pyramid;

pub use conv3d::*;
pub use decoder::*;
pub use discriminator::*;
pub use encoder::*;
pub use generator::*;
pub use inference::*;
pub use loss::*;
pub use penalty::*;
