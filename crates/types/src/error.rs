//! Error type shared by the core type layer.

use thiserror::Error;

/// Errors produced while interpreting external data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// External data does not fit the expected shape (wrong JSON type,
    /// non-integral number where an id was expected, etc).
    #[error("bad argument: {0}")]
    BadArgs(String),

    /// A byte slice had the wrong length for a fixed-width type.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// A raw block failed to parse.
    #[error("bad block: {0}")]
    BadBlock(String),
}

/// Result type for core type operations.
pub type Result<T> = std::result::Result<T, Error>;
