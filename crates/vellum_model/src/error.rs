//! Error types for the repository model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while building or querying a repository model.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Document type is not registered.
    #[error("unknown document type: {name}")]
    UnknownType {
        /// Name of the type.
        name: String,
    },

    /// Property name does not resolve for the given document type.
    #[error("unknown property {property} for type {doc_type}")]
    UnknownProperty {
        /// The document type queried.
        doc_type: String,
        /// The property name that failed to resolve.
        property: String,
    },

    /// Fragment (table) is not registered.
    #[error("unknown fragment: {name}")]
    UnknownFragment {
        /// Name of the fragment.
        name: String,
    },

    /// A builder registration conflicts with an existing one.
    #[error("duplicate registration: {message}")]
    DuplicateRegistration {
        /// Description of the conflict.
        message: String,
    },

    /// A registration references something not yet registered.
    #[error("invalid registration: {message}")]
    InvalidRegistration {
        /// Description of the problem.
        message: String,
    },
}

impl ModelError {
    /// Creates an unknown type error.
    pub fn unknown_type(name: impl Into<String>) -> Self {
        Self::UnknownType { name: name.into() }
    }

    /// Creates an unknown property error.
    pub fn unknown_property(doc_type: impl Into<String>, property: impl Into<String>) -> Self {
        Self::UnknownProperty {
            doc_type: doc_type.into(),
            property: property.into(),
        }
    }

    /// Creates an unknown fragment error.
    pub fn unknown_fragment(name: impl Into<String>) -> Self {
        Self::UnknownFragment { name: name.into() }
    }

    /// Creates a duplicate registration error.
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::DuplicateRegistration {
            message: message.into(),
        }
    }

    /// Creates an invalid registration error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRegistration {
            message: message.into(),
        }
    }
}
