//! Error types for the vision-token compression pipeline.
//!
//! The variants follow the four recovery classes the pipeline distinguishes:
//!
//! | Class | Variant | Policy |
//! |-------|---------|--------|
//! | configuration | [`VisionCotError::ConfigError`] | fatal before any forward pass |
//! | numeric | [`VisionCotError::NumericError`] | sample skipped by the trainer |
//! | artifact | [`VisionCotError::ArtifactLoadError`] | warning, random init for the group |
//! | encoder | [`VisionCotError::EncoderError`] | sample skipped by the trainer |
//! | sample | [`VisionCotError::SampleError`] | sample skipped by the trainer |

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the vision-token compression pipeline.
#[derive(Debug, Error)]
pub enum VisionCotError {
    /// Structural misconfiguration (caller bug). Never recovered.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// A loss term could not be made finite even on the MSE floor.
    #[error("Numeric error: {message}")]
    NumericError { message: String },

    /// A stage artifact was missing or malformed.
    #[error("Failed to load artifact '{path}': {message}")]
    ArtifactLoadError { path: PathBuf, message: String },

    /// The frozen teacher encoder rejected a bitmap.
    #[error("Teacher encoder error: {message}")]
    EncoderError { message: String },

    /// One sample cannot be laid out for the model (too long, nothing to
    /// supervise).
    #[error("Unusable sample: {message}")]
    SampleError { message: String },

    /// Pretrained backbone handle could not be loaded.
    #[error("Failed to load model: {message}")]
    ModelLoadError { message: String },

    /// Tokenizer loading, encoding or decoding failed.
    #[error("Tokenizer error: {message}")]
    TokenizerError { message: String },

    /// Input validation failed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch between two tensors that must agree.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Tensor operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// Dataset or config (de)serialization failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl VisionCotError {
    /// Whether a training loop should skip the offending sample and continue.
    ///
    /// Encoder, numeric and sample failures are tied to one sample's data.
    /// Everything else indicates a broken setup and aborts the run.
    pub fn is_sample_recoverable(&self) -> bool {
        matches!(
            self,
            VisionCotError::EncoderError { .. }
                | VisionCotError::NumericError { .. }
                | VisionCotError::SampleError { .. }
        )
    }
}

/// Result type for pipeline operations.
pub type VisionCotResult<T> = Result<T, VisionCotError>;
