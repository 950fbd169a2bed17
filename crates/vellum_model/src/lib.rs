//! # Vellum Model
//!
//! Static repository model for the Vellum document store.
//!
//! The model describes how a hierarchical document repository is laid out
//! over row-oriented tables:
//! - document types and their facets
//! - fragments (tables) and their column layout
//! - property name resolution to `(fragment, key)` pairs
//! - fulltext indexing configuration
//!
//! A [`Model`] is built once per repository with [`ModelBuilder`], is
//! immutable afterwards, and is shared read-only by every session.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod id;
mod layout;
mod model;
mod types;

pub use error::{ModelError, ModelResult};
pub use id::DocId;
pub use layout::*;
pub use model::{DocType, FragmentInfo, FragmentKind, Model, ModelBuilder, PropertyInfo};
pub use types::{FulltextKind, PropertyKind};
