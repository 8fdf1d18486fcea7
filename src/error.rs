//! Error types for quiver.

use thiserror::Error;

/// Errors that can occur while building, persisting or querying an index.
///
/// Every fatal condition carries enough context to identify the file or
/// parameter that triggered it. A full frontier heap is deliberately *not*
/// an error: dropped inserts only shrink the explored frontier and are
/// surfaced as a diagnostic counter instead.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid parameter combination (bad dimensionality, partition counts, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Dimension mismatch between a vector and the configured shape.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A codebook file failed structural validation.
    #[error("malformed codebook {path}: {reason}")]
    MalformedCodebook { path: String, reason: String },

    /// The bucket space `base^parts` does not fit in the addressable range.
    #[error("bucket space overflow: {base}^{parts} does not fit in 31 bits")]
    BucketOverflow { base: usize, parts: usize },

    /// I/O failure on a codebook or index file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Stored data disagrees with its declared shape (corrupted or
    /// incompatible file).
    #[error("data mismatch in {path}: {reason}")]
    DataMismatch { path: String, reason: String },
}

impl IndexError {
    /// Attach a path to an I/O error.
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type for quiver operations.
pub type Result<T> = std::result::Result<T, IndexError>;
