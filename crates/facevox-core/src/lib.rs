//! # Facevox-Core
//!
//! Core types and utilities for reconstructing volumetric faces from a
//! single photograph: scan points, labels, dataset statistics, bounding-box
//! geometry and the shared error taxonomy.

pub mod error;
pub mod geometry;
pub mod types;

pub use error::{Error, Result};
pub use geometry::*;
pub use types::*;
