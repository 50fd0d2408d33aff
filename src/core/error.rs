use ndarray::ShapeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("shape mismatch: expected length {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("gradient for {0} should have been stored")]
    MissingGradient(String),
    #[error(transparent)]
    DependencyUnavailable(#[from] ShapeError),
}

pub type Result<T> = std::result::Result<T, LayerError>;
