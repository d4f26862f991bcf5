//! Error types for the ferrylink pipeline.
//!
//! Every public operation resolves to either a value or one of these kinds.
//! The first six variants are the caller-facing taxonomy; the rest are the
//! ambient failures of the storage and configuration layers.

use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the ferrylink library.
#[derive(Debug, Error)]
pub enum FerryError {
    /// The logical request could not be turned into a valid URL.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Transport-level failure (timeout, reset, DNS, ...).
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    /// The response body did not match the expected shape.
    #[error("Decoding failed: {message}")]
    Decoding { message: String },

    /// Non-2xx response after the single post-refresh retry (if any).
    #[error("Server returned HTTP status {status}")]
    ServerStatus { status: u16, body: Bytes },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Unknown error")]
    Unknown,

    // Storage errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for ferrylink operations.
pub type Result<T> = std::result::Result<T, FerryError>;

impl From<std::io::Error> for FerryError {
    fn from(err: std::io::Error) -> Self {
        FerryError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        FerryError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for FerryError {
    fn from(err: rusqlite::Error) -> Self {
        FerryError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for FerryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            FerryError::InvalidRequest {
                message: err.to_string(),
            }
        } else {
            FerryError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl From<url::ParseError> for FerryError {
    fn from(err: url::ParseError) -> Self {
        FerryError::InvalidRequest {
            message: err.to_string(),
        }
    }
}

impl FerryError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        FerryError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a network error from a plain message.
    pub fn network(message: impl Into<String>) -> Self {
        FerryError::Network {
            message: message.into(),
            cause: None,
        }
    }

    /// Create a decoding error from any displayable cause.
    pub fn decoding(err: impl std::fmt::Display) -> Self {
        FerryError::Decoding {
            message: err.to_string(),
        }
    }

    /// HTTP status carried by a `ServerStatus` error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FerryError::ServerStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw response body carried by a `ServerStatus` error.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            FerryError::ServerStatus { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FerryError::Cancelled)
    }

    /// Check if this error is worth attempting again.
    ///
    /// The retry executor retries every failure; this is for callers deciding
    /// whether to resume a download or defer a request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FerryError::Network { .. } | FerryError::Decoding { .. }
        ) || matches!(self, FerryError::ServerStatus { status, .. } if *status >= 500)
    }
}
