//! Error types for conflux-ddl operations.

use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, DdlError>;

/// Errors that can occur during shard-DDL coordination.
#[derive(Debug, Error)]
pub enum DdlError {
    /// The metadata store failed.
    #[error(transparent)]
    Store(#[from] conflux_core::Error),

    /// A persisted value could not be decoded.
    #[error("decode error at {key}: {message}")]
    Decode {
        /// The key whose value failed to decode.
        key: String,
        /// Description of the decode failure.
        message: String,
    },
}

impl DdlError {
    /// Creates a decode error for the given key.
    #[must_use]
    pub fn decode(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Returns whether this error is worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Decode { .. } => false,
        }
    }
}
