//! Error types for the pairwise pipeline.

use thiserror::Error;

/// Result type alias using pairwise's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pairwise operations.
///
/// The job queue never inspects payloads; it only asks an error whether it is
/// retryable (see [`Error::is_retryable`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Similarity record not found
    #[error("Similarity record not found: {0}")]
    RecordNotFound(uuid::Uuid),

    /// Dedup rule not found
    #[error("Dedup rule not found: {0}")]
    RuleNotFound(uuid::Uuid),

    /// Dedup batch not found
    #[error("Dedup batch not found: {0}")]
    BatchNotFound(uuid::Uuid),

    /// Job queue error (illegal transition, contention)
    #[error("Job error: {0}")]
    Job(String),

    /// Permanent failure; retrying cannot succeed
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Workflow port failed
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a job failing with this error may be attempted again.
    ///
    /// Fatal errors, malformed input and configuration errors are permanent.
    /// Everything else (network, database, contention) is transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Fatal(_)
                | Error::InvalidInput(_)
                | Error::Serialization(_)
                | Error::Config(_)
                | Error::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
