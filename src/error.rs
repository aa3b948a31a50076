//! Error types for the next-warp library

use thiserror::Error;

/// Result type alias for next-warp operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during next-warp operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (K, bits, nprobe, k, thresholds).
    /// Raised before any work begins.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Embedding dimensionality does not match the trained codec or index
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Empty corpus, empty document, empty training sample or empty query
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// A loaded index failed structural validation
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// Document id outside the index
    #[error("Document {0} not found in index")]
    DocumentNotFound(usize),

    /// Error loading index
    #[error("Index load failed: {0}")]
    IndexLoad(String),

    /// Error reading/writing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// NPY read error
    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// NPY write error
    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}

impl Error {
    /// Shorthand used wherever an input's width is checked against the codec.
    pub(crate) fn check_dim(expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(Error::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}
