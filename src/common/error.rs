//! Error types for chunkmesh

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Metadata Errors ===
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Metadata corrupted: {0}")]
    Corrupted(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // === Placement Errors ===
    #[error("No capacity: {available} alive nodes, need at least {required}")]
    NoCapacity { available: usize, required: usize },

    #[error("Chunk {chunk_index} of {file_id} unavailable: every replica is on a dead node")]
    DataUnavailable { file_id: String, chunk_index: u32 },

    // === Request Errors ===
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Node Errors ===
    #[error("Node error: {0}")]
    NodeHttp(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NodeHttp(_) | Error::NoCapacity { .. })
    }

    /// Convert to HTTP status code for API responses
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DataUnavailable { .. } => StatusCode::CONFLICT,
            Error::Validation(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::NotFound("img".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::NoCapacity {
                available: 0,
                required: 1
            }
            .to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::DataUnavailable {
                file_id: "img".into(),
                chunk_index: 2
            }
            .to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Validation("bad".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Persistence("disk full".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::NodeHttp("timeout".into()).is_retryable());
        assert!(!Error::NotFound("img".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
    }
}
