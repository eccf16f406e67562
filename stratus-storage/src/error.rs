//! Storage error types.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
///
/// The core raises typed conditions only; mapping them to exit codes or
/// diagnostics is left to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("transient transport error: {0}")]
    Transport(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("credential issuer failed: {0}")]
    Credential(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Returns true for failures worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transport(_))
    }

    /// Returns true if the failure must abort a whole directory sync rather
    /// than only the entry it happened on.
    ///
    /// Transport errors only get here once their retries are spent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Transport(_) | StorageError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Maps an I/O error, keeping the path in the message.
    pub fn from_io(err: io::Error, path: impl std::fmt::Display) -> Self {
        let message = format!("{path}: {err}");
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(message),
            io::ErrorKind::AlreadyExists => StorageError::Conflict(message),
            io::ErrorKind::NotADirectory => StorageError::NotADirectory(message),
            io::ErrorKind::IsADirectory => StorageError::IsADirectory(message),
            io::ErrorKind::PermissionDenied => StorageError::Authorization(message),
            io::ErrorKind::InvalidInput => StorageError::Validation(message),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => StorageError::Transport(message),
            _ => StorageError::Io(err),
        }
    }

    /// Maps an HTTP status returned by a backend.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => StorageError::NotFound(message),
            409 | 412 => StorageError::Conflict(message),
            401 | 403 => StorageError::Authorization(message),
            400 | 416 | 422 => StorageError::Validation(message),
            408 | 429 | 500..=599 => StorageError::Transport(message),
            _ => StorageError::Provider(format!("HTTP {status}: {message}")),
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return StorageError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_builder() {
            return StorageError::Validation(err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return StorageError::Transport(err.to_string());
        }
        if err.is_decode() {
            return StorageError::Provider(format!("malformed response: {err}"));
        }
        StorageError::Transport(err.to_string())
    }
}

impl From<stratus_pattern::PatternError> for StorageError {
    fn from(err: stratus_pattern::PatternError) -> Self {
        StorageError::Validation(err.to_string())
    }
}

impl From<url::ParseError> for StorageError {
    fn from(err: url::ParseError) -> Self {
        StorageError::Validation(format!("invalid URL: {err}"))
    }
}

impl From<quick_xml::DeError> for StorageError {
    fn from(err: quick_xml::DeError) -> Self {
        StorageError::Provider(format!("malformed XML response: {err}"))
    }
}
