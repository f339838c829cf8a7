//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID contains whitespace.
    #[error("ID cannot contain whitespace: {0:?}")]
    Whitespace(String),

    /// A processor ID starts or ends with the standby separator, so the
    /// active or replica part would be empty.
    #[error("malformed standby suffix in processor ID {0:?}")]
    MalformedStandbySuffix(String),
}
