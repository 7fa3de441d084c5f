//! Error types for lowrank-attention.
//!
//! Failure modes covered:
//! - Shape mismatches (tensor dimensions, head splits, batch sizes)
//! - Invalid configuration (head count, activation name, aggregator dims)
//! - Cache lifecycle misuse (transforming an absent buffer)
//! - Weight loading (IO, SafeTensors, missing parameters)

use thiserror::Error;

/// Main error type for lowrank-attention.
///
/// All library functions return `Result<T, LowRankError>`.
/// No panics in library code - all failures go through this error type.
#[derive(Error, Debug)]
pub enum LowRankError {
    /// Shape mismatch between tensors or operations.
    ///
    /// Example: key batch size differs from query batch size.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape dimensions
        expected: Vec<usize>,
        /// Actual shape dimensions received
        got: Vec<usize>,
    },

    /// Dimension index out of range.
    ///
    /// Example: Attempting to reduce dimension 3 of a 2D tensor.
    #[error("Dimension out of range: {dim} for tensor with {ndim} dimensions")]
    DimOutOfRange {
        /// Dimension index that was accessed
        dim: usize,
        /// Number of dimensions in the tensor
        ndim: usize,
    },

    /// Configuration rejected at construction time.
    ///
    /// Example: `embed_dim` not divisible by the number of heads.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A cache operation needed buffers that were never initialized.
    #[error("Cache buffer not initialized: call init_buffer first")]
    BufferNotInitialized,

    /// A named parameter is missing from the loaded weights.
    #[error("Missing weight: {0}")]
    MissingWeight(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SafeTensors parsing or loading error.
    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    /// JSON parsing error.
    ///
    /// Wraps serde_json errors when parsing config files.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message.
    ///
    /// Prefer specific variants for better error context.
    #[error("{0}")]
    Msg(String),
}

/// Result type alias for lowrank-attention.
pub type Result<T> = std::result::Result<T, LowRankError>;
