//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only: a malformed job description or an identifier
/// that does not parse will fail the same way on every redelivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A required identifier was absent or blank.
    #[error("missing identifier: {0}")]
    MissingIdentifier(&'static str),

    /// A work batch exceeded its fixed ceiling.
    #[error("batch of {len} exceeds maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn missing(field: &'static str) -> Self {
        Self::MissingIdentifier(field)
    }
}

/// Reject blank identifiers.
pub fn require_non_blank(field: &'static str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::missing(field));
    }
    Ok(())
}
