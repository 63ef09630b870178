//! Error types for blob store operations.

use std::fmt;

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
///
/// The store never retries on its own. Callers use [`BlobError::is_retryable`]
/// to decide whether an operation is worth another attempt.
#[derive(Debug)]
pub enum BlobError {
    /// Blob chunk not found at the specified location.
    NotFound { uri: String },

    /// Invalid URI format.
    InvalidUri { uri: String, reason: String },

    /// Backend not supported.
    UnsupportedBackend { scheme: String },

    /// Local I/O error during a chunk transfer.
    IoError { uri: String, source: std::io::Error },

    /// Network error talking to a pre-signed URI.
    NetworkError { uri: String, source: anyhow::Error },

    /// The remote store answered with a non-success HTTP status.
    HttpStatus { uri: String, status: u16 },

    /// Requested byte range does not fit into the blob.
    OutOfRange {
        blob_id: String,
        offset: u64,
        size: u64,
        blob_size: u64,
    },

    /// Chunk layout can't satisfy the object store limits.
    InvalidLayout { reason: String },

    /// Generic error.
    Other { source: anyhow::Error },
}

impl BlobError {
    /// Transport failures are always worth retrying by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlobError::IoError { .. } | BlobError::NetworkError { .. } | BlobError::HttpStatus { .. }
        )
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::NotFound { uri } => write!(f, "Blob chunk not found: {}", uri),
            BlobError::InvalidUri { uri, reason } => {
                write!(f, "Invalid URI '{}': {}", uri, reason)
            }
            BlobError::UnsupportedBackend { scheme } => {
                write!(f, "Unsupported backend: {}", scheme)
            }
            BlobError::IoError { uri, source } => write!(f, "I/O error on {}: {}", uri, source),
            BlobError::NetworkError { uri, source } => {
                write!(f, "Network error on {}: {}", uri, source)
            }
            BlobError::HttpStatus { uri, status } => {
                write!(f, "Unexpected HTTP status {} from {}", status, uri)
            }
            BlobError::OutOfRange {
                blob_id,
                offset,
                size,
                blob_size,
            } => write!(
                f,
                "Range [{}, {}) is outside of blob {} of size {}",
                offset,
                offset.saturating_add(*size),
                blob_id,
                blob_size
            ),
            BlobError::InvalidLayout { reason } => write!(f, "Invalid chunk layout: {}", reason),
            BlobError::Other { source } => write!(f, "Blob store error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::IoError { source, .. } => Some(source),
            BlobError::NetworkError { source, .. } => Some(source.as_ref()),
            BlobError::Other { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        BlobError::Other { source: err }
    }
}
