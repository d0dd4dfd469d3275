//! Error types for guidance evaluation and configuration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuidanceError {
    #[error("Tensor data error: {0}")]
    TensorData(String),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Empty batch: at least one conditioning is required")]
    EmptyBatch,

    #[error("Empty tensor where a scalar was expected")]
    EmptyTensor,

    #[error("Backend returned {actual} predictions for {expected} conditionings")]
    PredictionCount { expected: usize, actual: usize },

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },
}
