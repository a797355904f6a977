//! Error types for meshgate

use thiserror::Error;

/// Result type alias using meshgate Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshgate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Address space exhausted in {network}")]
    AddressExhausted { network: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Signing tool exited with {status}: {stderr}")]
    SignerFailed { status: String, stderr: String },

    #[error("Expected artifact missing: {0}")]
    MissingArtifact(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Broker(e.to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound { kind, id } => {
                tonic::Status::not_found(format!("{} {} not found", kind, id))
            }
            Error::InvalidInput(msg) => tonic::Status::invalid_argument(msg),
            Error::Unauthorized(msg) => tonic::Status::unauthenticated(msg),
            Error::Timeout { seconds } => {
                tonic::Status::deadline_exceeded(format!("Operation timed out after {}s", seconds))
            }
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = tonic::Status::from(Error::not_found("device", "laptop"));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "device laptop not found");

        let status = tonic::Status::from(Error::Unauthorized("missing token".into()));
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        let status = tonic::Status::from(Error::Broker("closed".into()));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
