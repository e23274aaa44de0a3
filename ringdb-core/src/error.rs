//! Error types for RingDB

use thiserror::Error;

/// Result type alias for RingDB operations
pub type Result<T> = std::result::Result<T, RingError>;

/// RingDB error types
#[derive(Error, Debug)]
pub enum RingError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Malformed ingestion frame
    #[error("{0}")]
    Protocol(String),

    /// Sample older than the late-write window
    #[error("late write")]
    LateWrite,

    /// Query could not be parsed or validated
    #[error("query parsing error: {0}")]
    QueryParse(String),

    /// Metric or series is unknown
    #[error("not found: {0}")]
    NotFound(String),

    /// Recovery could not reconstruct state
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RingError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, RingError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RingError::Corruption(_) | RingError::ChecksumMismatch { .. }
        )
    }

    /// Single-line form sent back to clients, without the line terminator.
    ///
    /// Query parse errors never leak their detail; the detail is logged
    /// by the caller instead.
    pub fn wire_message(&self) -> String {
        match self {
            RingError::Protocol(reason) => format!("-PARSER {}", reason),
            RingError::LateWrite => "-DB late write".to_string(),
            RingError::QueryParse(_) => "-query parsing error".to_string(),
            RingError::NotFound(_) => "-not found".to_string(),
            other => format!("-DB {}", other),
        }
    }
}

impl From<bincode::Error> for RingError {
    fn from(e: bincode::Error) -> Self {
        RingError::InvalidFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages() {
        assert_eq!(
            RingError::Protocol("bad timestamp".into()).wire_message(),
            "-PARSER bad timestamp"
        );
        assert_eq!(RingError::LateWrite.wire_message(), "-DB late write");
        assert_eq!(
            RingError::QueryParse("unknown key `foo`".into()).wire_message(),
            "-query parsing error"
        );
        assert_eq!(
            RingError::NotFound("cpu".into()).wire_message(),
            "-not found"
        );
    }

    #[test]
    fn test_classification() {
        let io = RingError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());
        assert!(RingError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
    }
}
