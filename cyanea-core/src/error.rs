//! Structured error types for the cyanea workspace.

use thiserror::Error;

/// Unified error type for all cyanea operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CyaneaError {
    /// Parse error (malformed Newick, bad numeric literal, ...)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values, unknown handles)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A value had a different variant than the caller required.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A structural invariant of a model object does not hold.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the cyanea workspace.
pub type Result<T> = std::result::Result<T, CyaneaError>;
