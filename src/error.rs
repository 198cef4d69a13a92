//! Error types for the Hivelimit crate.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Hivelimit operations.
#[derive(Error, Debug)]
pub enum HivelimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The rate limit key was empty
    #[error("Rate limit key must not be empty")]
    EmptyKey,

    /// The distributed store failed a get/set/remove or its loader failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Counter bytes read back from the store could not be decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A store round-trip exceeded the configured operation timeout
    #[error("Store {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The caller's cancellation signal fired before the decision was made
    #[error("Rate limit check cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Hivelimit operations.
pub type Result<T> = std::result::Result<T, HivelimitError>;
