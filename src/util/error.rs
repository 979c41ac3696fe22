//! Error types for the rayflow library.

use thiserror::Error;

/// Main error type for rendering, aggregation and session operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The external evaluator failed on a chunk
    #[error("Evaluator failed on chunk {chunk}: {message}")]
    Evaluator { chunk: usize, message: String },

    /// A later chunk lacks a field that the first chunk reported
    #[error("Schema mismatch in {tier} tier: chunk {chunk} is missing field '{field}'")]
    SchemaMismatch {
        tier: &'static str,
        field: String,
        chunk: usize,
    },

    /// A later chunk reports a field the first chunk did not (reject policy)
    #[error("Unexpected field '{field}' in {tier} tier at chunk {chunk}")]
    UnexpectedField {
        tier: &'static str,
        field: String,
        chunk: usize,
    },

    /// Tensor shapes are incompatible for the requested operation
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Shape cannot be constructed or inferred
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Ray batch has no rays
    #[error("Ray batch is empty")]
    EmptyBatch,

    /// Chunk size must be at least one ray
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    /// Raw render payload could not be turned into a session output
    #[error("Malformed render output: {0}")]
    MalformedOutput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an evaluator failure for the given chunk.
    pub fn evaluator(chunk: usize, msg: impl Into<String>) -> Self {
        Self::Evaluator {
            chunk,
            message: msg.into(),
        }
    }

    /// Create a malformed-output error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput(msg.into())
    }

    /// Create a shape mismatch error from anything printable.
    pub fn shape(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Self::ShapeMismatch {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

/// Result type alias for rayflow operations.
pub type Result<T> = std::result::Result<T, Error>;
