//! Error types for poppy.

use thiserror::Error;

/// Main error type for poppy operations.
#[derive(Error, Debug)]
pub enum PoppyError {
    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Samples do not contain weights")]
    MissingWeights,

    #[error("Log weights contain NaN values for beta={beta}")]
    NanWeights { beta: f64 },

    #[error("Tensor backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "arrow")]
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[cfg(feature = "parquet")]
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[cfg(feature = "plot")]
    #[error("Plotting error: {0}")]
    Plot(String),
}

/// Result type alias for poppy operations.
pub type Result<T> = std::result::Result<T, PoppyError>;

impl PoppyError {
    /// Create a new shape error.
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a new invalid input error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<ndarray::ShapeError> for PoppyError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape(err.to_string())
    }
}
