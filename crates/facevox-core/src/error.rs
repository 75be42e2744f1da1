//! Error types for the facevox reconstruction system.

use thiserror::Error;

use crate::types::{Axis, Network};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Degenerate geometry: point cloud has zero extent along the {axis} axis")]
    DegenerateGeometry { axis: Axis },

    #[error("Point {index} projects to cell {cell:?}, outside the {resolution}^3 grid")]
    PerPointProjectionOverflow {
        index: usize,
        cell: [i64; 3],
        resolution: usize,
    },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{network} loss `{metric}` diverged to {value}")]
    OptimizerDivergence {
        network: Network,
        metric: String,
        value: f32,
    },

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed scan file: {0}")]
    ScanFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds a `ShapeMismatch` from any pair of dimension slices.
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failure() {
        let err = Error::DegenerateGeometry { axis: Axis::X };
        assert!(err.to_string().contains("x axis"));

        let err = Error::shape_mismatch("discriminator input", &[2, 4, 8, 8, 8], &[2, 1, 8, 8, 8]);
        assert!(err.to_string().contains("[2, 4, 8, 8, 8]"));

        let err = Error::OptimizerDivergence {
            network: Network::Generator,
            metric: "G_loss".to_string(),
            value: f32::NAN,
        };
        assert!(err.to_string().starts_with("generator loss `G_loss`"));
    }
}
