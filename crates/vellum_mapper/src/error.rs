//! Error types for the persistence layer.

use std::io;
use thiserror::Error;
use vellum_model::ModelError;

/// Result type for persistence operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in persistence operations.
///
/// The taxonomy matters for callers:
/// - [`StoreError::ConcurrentUpdate`] is the only *retryable* class
///   (unique-constraint or snapshot-isolation conflicts); the lock
///   manager retries it, everything else is surfaced immediately.
/// - [`StoreError::InvalidName`], [`StoreError::DocumentExists`] and
///   friends are fail-fast input errors, never wrapped or retried.
/// - [`StoreError::InvalidState`] signals a logic bug (fragment state
///   machine misuse, cross-thread session use), not a transient
///   condition.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Model lookup failure.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// I/O error from an underlying store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic persistence failure.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Retryable concurrent-update conflict (unique constraint violation
    /// or snapshot-isolation serialization failure).
    #[error("concurrent update: {message}")]
    ConcurrentUpdate {
        /// Description of the conflict.
        message: String,
    },

    /// Raised after a bounded retry loop exhausts its attempts.
    #[error("too much concurrency, operation gave up after {attempts} attempts")]
    TooManyConcurrentUpdates {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A name contains illegal characters or is empty.
    #[error("invalid name: {name:?}")]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// A destination name is already taken in the target parent.
    #[error("destination name already exists: {name}")]
    DocumentExists {
        /// The conflicting name.
        name: String,
    },

    /// A hierarchy operation would create a cycle.
    #[error("cannot {operation} a node under itself: {message}")]
    StructuralCycle {
        /// The operation attempted ("move" or "copy").
        operation: String,
        /// Description of the offending nodes.
        message: String,
    },

    /// Misuse of a state machine or of a single-threaded component.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the misuse.
        message: String,
    },

    /// Operation not permitted on the given input.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl StoreError {
    /// Creates a generic storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a retryable concurrent-update error.
    pub fn concurrent_update(message: impl Into<String>) -> Self {
        Self::ConcurrentUpdate {
            message: message.into(),
        }
    }

    /// Creates an invalid name error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    /// Creates a name-conflict error.
    pub fn document_exists(name: impl Into<String>) -> Self {
        Self::DocumentExists { name: name.into() }
    }

    /// Creates a structural-cycle error.
    pub fn structural_cycle(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StructuralCycle {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether this error is a retryable concurrency conflict.
    #[must_use]
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_classification() {
        assert!(StoreError::concurrent_update("dup key").is_concurrency());
        assert!(!StoreError::storage("disk on fire").is_concurrency());
        assert!(!StoreError::TooManyConcurrentUpdates { attempts: 10 }.is_concurrency());
    }
}
