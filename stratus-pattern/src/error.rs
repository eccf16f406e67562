//! Pattern error types.

use thiserror::Error;

/// Result type for pattern operations.
pub type PatternResult<T> = Result<T, PatternError>;

/// Errors raised while compiling or loading patterns.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to read ignore file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ignore file {0} is not valid UTF-8")]
    Encoding(String),
}
