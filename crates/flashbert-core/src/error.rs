//! Error types for FlashBert Core.

use thiserror::Error;

/// Result type alias for FlashBert operations.
pub type Result<T> = std::result::Result<T, FlashBertError>;

/// Errors that can occur while building or running the encoder.
#[derive(Error, Debug)]
pub enum FlashBertError {
    /// A named tensor is absent from the checkpoint.
    #[error("tensor not found in checkpoint: {name}")]
    MissingTensor {
        /// Fully qualified tensor name.
        name: String,
    },

    /// Only absolute position embeddings are supported.
    #[error("unsupported position embedding type: {0} (only \"absolute\" is supported)")]
    UnsupportedPositionEmbedding(String),

    /// Unknown `hidden_act` string.
    #[error("unsupported activation function: {0}")]
    UnsupportedActivation(String),

    /// Config values that cannot describe a valid encoder.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Batch variant not accepted by the selected backend.
    #[error("backend {backend} expects {expected} batches, got {got}")]
    UnsupportedBatch {
        /// Backend name.
        backend: &'static str,
        /// Batch kind the backend accepts.
        expected: &'static str,
        /// Batch kind that was supplied.
        got: &'static str,
    },

    /// Malformed batch (inconsistent lengths, bad offsets, bad mask).
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Request longer than the model accepts.
    #[error("input length {length} exceeds model max_input_length {max}")]
    InputTooLong {
        /// Requested length.
        length: usize,
        /// Model limit.
        max: usize,
    },

    /// Id outside of an embedding table.
    #[error("index {index} out of range for {table} embeddings of size {size}")]
    EmbeddingIndex {
        /// Table name.
        table: &'static str,
        /// Offending id.
        index: u32,
        /// Number of rows in the table.
        size: usize,
    },

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Model loading error.
    #[error("model error: {0}")]
    ModelError(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

/// Coarse classification of a [`FlashBertError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fatal at load time.
    Construction,
    /// Batch variant not legal for the device class.
    UnsupportedBatch,
    /// Shape, index or kernel failure during a call.
    Numeric,
    /// Filesystem or parse failure.
    Io,
}

impl FlashBertError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingTensor { .. }
            | Self::UnsupportedPositionEmbedding(_)
            | Self::UnsupportedActivation(_)
            | Self::InvalidConfig(_)
            | Self::ModelError(_) => ErrorCategory::Construction,
            Self::UnsupportedBatch { .. } => ErrorCategory::UnsupportedBatch,
            Self::InvalidBatch(_)
            | Self::InputTooLong { .. }
            | Self::EmbeddingIndex { .. }
            | Self::ShapeMismatch(_)
            | Self::TensorError(_) => ErrorCategory::Numeric,
            Self::IoError(_) | Self::SerdeError(_) => ErrorCategory::Io,
        }
    }
}
