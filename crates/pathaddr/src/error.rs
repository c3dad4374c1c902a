//! Error types for address construction and parsing.

use thiserror::Error;

/// Errors that can occur while building or parsing addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The same key appears twice in one address
    #[error("duplicate resource key '{key}' in address")]
    DuplicateKey {
        /// The repeated key
        key: String,
    },

    /// A key or value is empty or contains a reserved character
    #[error("invalid path element '{element}': {reason}")]
    InvalidElement {
        /// The offending element text
        element: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Address text could not be parsed
    #[error("malformed address '{input}': {reason}")]
    Malformed {
        /// The text that failed to parse
        input: String,
        /// Why parsing failed
        reason: String,
    },
}

/// Result type for address operations.
pub type Result<T> = std::result::Result<T, AddressError>;
