//! # Vellum Mapper
//!
//! Row-level data model and database abstraction for the Vellum document
//! store.
//!
//! This crate provides:
//! - [`Value`] and [`Row`]/[`RowId`]: the raw data-transfer units
//! - [`RowBatch`]/[`RowUpdate`]: the unit-of-work flush format
//! - [`Invalidations`] and its queue/propagator: the cross-session cache
//!   coherence substrate
//! - [`RowMapper`]: the trait abstracting actual database I/O
//! - [`MemoryMapper`]: a complete in-memory mapper used by tests and
//!   ephemeral repositories

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod invalidations;
mod mapper;
mod memory;
mod row;
mod value;

pub use error::{StoreError, StoreResult};
pub use invalidations::{Invalidations, InvalidationsPropagator, InvalidationsQueue, PARENT_INVAL};
pub use mapper::{
    CopyResult, IdWithTypes, Lock, NodeInfo, RowMapper, RowRead, SelectionType,
};
pub use memory::MemoryMapper;
pub use row::{Row, RowBatch, RowData, RowId, RowUpdate};
pub use value::{AclEntry, DeltaLong, Value};
