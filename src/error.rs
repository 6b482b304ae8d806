//! Error types for kickgen.

use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Audio processing error (WAV I/O, feature extraction).
    #[error("audio: {0}")]
    Audio(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// A checkpoint was produced with a configuration that does not match
    /// the network being instantiated.
    #[error("config mismatch on `{field}`: checkpoint has {checkpoint}, expected {expected}")]
    ConfigMismatch {
        field: &'static str,
        checkpoint: String,
        expected: String,
    },

    /// Missing, partial or incompatible checkpoint bundle.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// No usable training examples were found.
    #[error("dataset at {} is empty", .0.display())]
    EmptyDataset(PathBuf),

    /// Spatial misalignment between tensors that must line up.
    #[error("shape: {0}")]
    Shape(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Metadata CSV error.
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for Error {
    fn from(error: rubato::ResamplerConstructionError) -> Self {
        Error::Audio(format!("resampler: {error}"))
    }
}

impl From<rubato::ResampleError> for Error {
    fn from(error: rubato::ResampleError) -> Self {
        Error::Audio(format!("resampling: {error}"))
    }
}
