//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures of the job state machine: a command that does not
/// fit the current step, a malformed collaborator output, a violated content
/// invariant. Storage and network failures belong to the infra/ai crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request or collaborator output was rejected (e.g. an empty outline).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. re-marking a canonical section).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier or step string was invalid.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A chapter or section the command names is not in the outline.
    #[error("not found")]
    NotFound,

    /// The command does not fit the job's current step or cover state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
