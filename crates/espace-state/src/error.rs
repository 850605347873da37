//! Error types for the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The key holds no value. Distinct from an empty value.
    #[error("not found: {0}")]
    NotFound(String),

    /// The database could not be reached or answered abnormally. Callers may
    /// retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// A handle was requested without a usable id.
    #[error("a store handle requires a non-nil id")]
    Precondition,
}
