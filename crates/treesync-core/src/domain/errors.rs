//! Domain error types
//!
//! Errors raised while constructing or decoding domain values.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The options blob is not framed or delimited as expected
    #[error("Invalid options encoding: {0}")]
    InvalidOptions(String),
}
