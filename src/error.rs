//! Error types for VulcanoDb.

use thiserror::Error;

/// The unified error type for all engine operations.
#[derive(Error, Debug)]
pub enum VulcanoError {
    /// An underlying I/O operation failed (segment map, read, write, fsync).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state is inconsistent: unknown value type, truncated header,
    /// key length disagreeing with entry length. Never auto-repaired.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The caller supplied an invalid argument (wrong vector dimensions,
    /// wrong field type for an operator, out-of-range configuration).
    #[error("Validation error: {0}")]
    Validation(String),

    /// An index-level operation failed.
    #[error("Index error: {0}")]
    Index(String),

    /// The query deadline elapsed; the caller receives a partial result.
    #[error("Query deadline exceeded")]
    Timeout,

    /// The engine has been closed; no further operations are accepted.
    #[error("Engine is closed")]
    Closed,

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VulcanoError {
    /// Create a corruption error.
    pub fn corruption<S: Into<String>>(message: S) -> Self {
        VulcanoError::Corruption(message.into())
    }

    /// Create a validation error.
    pub fn validation<S: Into<String>>(message: S) -> Self {
        VulcanoError::Validation(message.into())
    }

    /// Create an index error.
    pub fn index<S: Into<String>>(message: S) -> Self {
        VulcanoError::Index(message.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        VulcanoError::Internal(message.into())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, VulcanoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VulcanoError::corruption("bad entry length");
        assert_eq!(err.to_string(), "Corruption: bad entry length");

        let err = VulcanoError::validation("vector has 3 dimensions, index expects 2");
        assert!(err.to_string().starts_with("Validation error"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: VulcanoError = io.into();
        assert!(matches!(err, VulcanoError::Io(_)));
    }
}
