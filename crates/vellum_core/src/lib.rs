//! # Vellum Core
//!
//! Persistence core of the Vellum document repository.
//!
//! This crate maps a hierarchical, versioned content model (documents,
//! complex properties, ACLs, locks, versions, proxies) onto row-oriented
//! tables behind a [`RowMapper`], while presenting an in-memory object
//! graph to callers. It provides:
//! - session-bound [`Fragment`]s with a validated lifecycle state machine
//!   and per-key dirty tracking
//! - the [`PersistenceContext`]: a per-session write-behind unit of work
//!   with flush-to-batch semantics
//! - children/selection caches with soft/hard promotion
//! - two caching row-mapper decorators with cross-session invalidation
//! - a serialized, retry-driven [`LockManager`]
//! - a content-addressed binary store with mark-and-sweep GC
//!
//! Sessions are single-threaded by design; concurrency across sessions
//! is achieved entirely through the invalidation-queue protocol, never
//! by locking session state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod binary;
mod cache;
mod config;
mod context;
mod fragment;
mod lock;
mod lru;
mod node;
mod selection;
mod session;
mod stats;

pub use binary::{Binary, BinaryManager, FsBinaryStore, GcInfo};
pub use cache::{CachedRow, RowCache, SessionCachingMapper, SharedCachingMapper};
pub use config::{LockRetryPolicy, StoreConfig};
pub use context::PersistenceContext;
pub use fragment::{Fragment, FragmentData, FragmentRef, State};
pub use lock::LockManager;
pub use lru::LruMap;
pub use node::{CollectionProperty, Node, SimpleProperty};
pub use selection::{Selection, SelectionContext, SelectionLookup};
pub use session::Session;
pub use stats::CacheStats;

pub use vellum_mapper::{
    AclEntry, CopyResult, DeltaLong, IdWithTypes, Invalidations, InvalidationsPropagator,
    InvalidationsQueue, Lock, MemoryMapper, NodeInfo, Row, RowBatch, RowId, RowMapper, RowRead,
    RowUpdate, SelectionType, StoreError, StoreResult, Value,
};
