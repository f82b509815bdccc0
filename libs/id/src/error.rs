//! Errors produced when parsing typed IDs.

use thiserror::Error;

/// Errors that can occur when parsing an ID from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The input string was empty.
    #[error("empty id string")]
    Empty,

    /// The input had no `_` separating prefix from ULID.
    #[error("missing '_' separator")]
    MissingSeparator,

    /// The prefix did not match the expected resource type.
    #[error("invalid prefix: expected '{expected}', found '{found}'")]
    InvalidPrefix { expected: String, found: String },

    /// The ULID portion failed to parse.
    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
}
