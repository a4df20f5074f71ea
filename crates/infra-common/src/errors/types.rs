use thiserror::Error;

/// Result alias for infrastructure operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the shared infrastructure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or unusable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Error with a caller-supplied message
    #[error("{0}")]
    Custom(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}
