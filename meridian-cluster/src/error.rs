//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation was refused because it would violate a cluster invariant
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Probe error: {0}")]
    Probe(String),

    /// A probe produced no verdict within its check timeout
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<meridian_core::Error> for Error {
    fn from(err: meridian_core::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
