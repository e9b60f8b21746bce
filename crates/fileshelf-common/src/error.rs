//! Error types for fileshelf
//!
//! This module defines the common error types used throughout the system.

use crate::types::{FileId, FileIdError, SlugError};
use thiserror::Error;
use uuid::Uuid;

/// Common result type for fileshelf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for fileshelf
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(#[from] FileIdError),

    #[error("invalid slug: {0}")]
    InvalidSlug(#[from] SlugError),

    #[error("slug {0:?} is taken by another file")]
    SlugTaken(String),

    #[error("too many metadata predicates: {count} exceeds the limit of {max}")]
    TooManyPredicates { count: usize, max: usize },

    // Lookup errors
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Metadata exists but the blob could not be read from local disk
    #[error("blob for file {id} is missing from local storage")]
    BlobMissing { id: FileId },

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    // Bus / coordination errors
    #[error("message bus error: {0}")]
    Bus(String),

    #[error("timed out waiting for commit {0}")]
    CommitTimeout(Uuid),

    #[error("node is not ready: {0}")]
    NotReady(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a bus error
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// Create a not found error for anything displayable
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::FileNotFound(what.to_string())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Bus(_) | Self::CommitTimeout(_) | Self::NotReady(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound(_) | Self::BlobMissing { .. })
    }

    /// Check if this error was caused by bad caller input
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::InvalidFileId(_)
                | Self::InvalidSlug(_)
                | Self::TooManyPredicates { .. }
        )
    }

    /// Get HTTP status code for the download adapter
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidInput(_)
            | Self::InvalidFileId(_)
            | Self::InvalidSlug(_)
            | Self::TooManyPredicates { .. } => 400,

            // 404 Not Found
            Self::FileNotFound(_) | Self::BlobMissing { .. } => 404,

            // 409 Conflict
            Self::SlugTaken(_) => 409,

            // 500 Internal Server Error
            Self::Io(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,

            // 503 Service Unavailable
            Self::Bus(_) | Self::NotReady(_) => 503,

            // 504 Gateway Timeout
            Self::CommitTimeout(_) => 504,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::CommitTimeout(Uuid::new_v4()).is_retryable());
        assert!(Error::bus("connection refused").is_retryable());
        assert!(!Error::SlugTaken("a.txt".into()).is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("slug \"a.txt\"").is_not_found());
        assert!(Error::BlobMissing { id: FileId::new() }.is_not_found());
        assert!(!Error::invalid_input("x").is_not_found());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::SlugTaken("a".into()).http_status_code(), 409);
        assert_eq!(Error::not_found("x").http_status_code(), 404);
        assert_eq!(
            Error::TooManyPredicates { count: 61, max: 60 }.http_status_code(),
            400
        );
        assert_eq!(Error::internal("x").http_status_code(), 500);
    }

    #[test]
    fn test_file_id_error_converts() {
        let err: Error = FileIdError::Empty.into();
        assert!(err.is_invalid_input());
    }
}
