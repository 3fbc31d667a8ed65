//! Error types for vendtally-core

use thiserror::Error;

/// Main error type for the vendtally-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Bad machine id or capacity, or the counter is not initialized
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Machine id mismatch, zero category, or a disallowed runtime config change
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Reserved; the ring buffer overwrites instead of filling up
    #[error("storage full")]
    StorageFull,

    /// The sink could not be reached or reported a transient failure
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The sink rejected the request, or a sync is already running
    #[error("API error: {0}")]
    ApiError(String),

    /// Ring buffer allocation failed
    #[error("memory allocation error: {0}")]
    MemoryError(String),

    /// Persisted state could not be read, written, or decoded
    #[error("storage error: {0}")]
    Storage(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure is transient and worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkUnavailable(_))
    }
}

/// Result type alias for vendtally-core
pub type Result<T> = std::result::Result<T, Error>;
