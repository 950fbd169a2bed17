//! Cache invalidation substrate.
//!
//! Invalidations are the only coherence mechanism between sessions: a
//! committing session pushes the row ids it touched to every sibling
//! queue, and each session drains its own queue at its next transaction
//! boundary. There is no lock on any cache during reads.

use crate::row::RowId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use vellum_model::DocId;

/// Pseudo table name carried by an invalidation meaning "the child set
/// of this id changed", decoupling selection invalidation from fragment
/// invalidation.
pub const PARENT_INVAL: &str = "__PARENT__";

/// A set of modified and deleted row ids to evict from caches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidations {
    /// Invalidate everything; set by large operations that cannot
    /// enumerate what they touched.
    pub all: bool,
    /// Rows whose content changed.
    pub modified: HashSet<RowId>,
    /// Rows that were deleted.
    pub deleted: HashSet<RowId>,
}

impl Invalidations {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an "invalidate everything" marker.
    #[must_use]
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Whether nothing is invalidated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Records a modified row.
    pub fn add_modified(&mut self, row_id: RowId) {
        self.modified.insert(row_id);
    }

    /// Records a modified parent (child-set change).
    pub fn add_modified_parent(&mut self, parent_id: DocId) {
        self.modified.insert(RowId::new(PARENT_INVAL, parent_id));
    }

    /// Records a deleted row.
    pub fn add_deleted(&mut self, row_id: RowId) {
        self.deleted.insert(row_id);
    }

    /// Merges another set into this one.
    pub fn add(&mut self, other: &Invalidations) {
        self.all |= other.all;
        self.modified.extend(other.modified.iter().cloned());
        self.deleted.extend(other.deleted.iter().cloned());
    }
}

impl fmt::Display for Invalidations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalidations(all={}, modified={}, deleted={})",
            self.all,
            self.modified.len(),
            self.deleted.len()
        )
    }
}

/// Accumulates invalidations addressed to one session's caches.
///
/// Senders add, the owner drains. The queue is unbounded; it is drained
/// at every transaction boundary, which bounds it in practice by the
/// write rate of concurrent sessions within one transaction.
#[derive(Debug, Default)]
pub struct InvalidationsQueue {
    queued: Mutex<Invalidations>,
}

impl InvalidationsQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds invalidations to the queue.
    pub fn add(&self, invalidations: &Invalidations) {
        if invalidations.is_empty() {
            return;
        }
        self.queued.lock().add(invalidations);
    }

    /// Drains the queue, returning `None` when nothing accumulated.
    #[must_use]
    pub fn take(&self) -> Option<Invalidations> {
        let mut queued = self.queued.lock();
        if queued.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *queued))
    }
}

/// Distributes invalidations to every registered queue except the
/// sender's own.
///
/// One propagator exists per repository (or per cluster group when
/// bridging nodes); each session's caching mapper registers its queue on
/// creation and unregisters on close.
#[derive(Debug, Default)]
pub struct InvalidationsPropagator {
    queues: RwLock<Vec<Arc<InvalidationsQueue>>>,
}

impl InvalidationsPropagator {
    /// Creates a propagator with no queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queue.
    pub fn add_queue(&self, queue: Arc<InvalidationsQueue>) {
        let mut queues = self.queues.write();
        if !queues.iter().any(|q| Arc::ptr_eq(q, &queue)) {
            queues.push(queue);
        }
    }

    /// Unregisters a queue.
    pub fn remove_queue(&self, queue: &Arc<InvalidationsQueue>) {
        self.queues.write().retain(|q| !Arc::ptr_eq(q, queue));
    }

    /// Number of registered queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.read().len()
    }

    /// Propagates invalidations to all queues except `skip`.
    pub fn propagate(&self, invalidations: &Invalidations, skip: Option<&Arc<InvalidationsQueue>>) {
        if invalidations.is_empty() {
            return;
        }
        trace!(%invalidations, queues = self.queue_count(), "propagating");
        for queue in self.queues.read().iter() {
            if let Some(own) = skip {
                if Arc::ptr_eq(queue, own) {
                    continue;
                }
            }
            queue.add(invalidations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_id(table: &str) -> RowId {
        RowId::new(table, DocId::new())
    }

    #[test]
    fn empty_and_add() {
        let mut inv = Invalidations::new();
        assert!(inv.is_empty());
        inv.add_modified(row_id("hierarchy"));
        assert!(!inv.is_empty());

        let mut other = Invalidations::new();
        other.add_deleted(row_id("versions"));
        inv.add(&other);
        assert_eq!(inv.modified.len(), 1);
        assert_eq!(inv.deleted.len(), 1);
    }

    #[test]
    fn queue_drains_once() {
        let queue = InvalidationsQueue::new();
        assert!(queue.take().is_none());

        let mut inv = Invalidations::new();
        inv.add_modified(row_id("hierarchy"));
        queue.add(&inv);
        queue.add(&inv);

        let drained = queue.take().unwrap();
        assert_eq!(drained.modified.len(), 1);
        assert!(queue.take().is_none());
    }

    #[test]
    fn propagator_skips_sender() {
        let propagator = InvalidationsPropagator::new();
        let own = Arc::new(InvalidationsQueue::new());
        let other = Arc::new(InvalidationsQueue::new());
        propagator.add_queue(Arc::clone(&own));
        propagator.add_queue(Arc::clone(&other));

        let mut inv = Invalidations::new();
        inv.add_modified(row_id("hierarchy"));
        propagator.propagate(&inv, Some(&own));

        assert!(own.take().is_none());
        assert!(other.take().is_some());
    }

    #[test]
    fn propagator_remove_queue() {
        let propagator = InvalidationsPropagator::new();
        let queue = Arc::new(InvalidationsQueue::new());
        propagator.add_queue(Arc::clone(&queue));
        assert_eq!(propagator.queue_count(), 1);
        propagator.remove_queue(&queue);
        assert_eq!(propagator.queue_count(), 0);
    }

    #[test]
    fn parent_invalidation_uses_pseudo_table() {
        let mut inv = Invalidations::new();
        let parent = DocId::new();
        inv.add_modified_parent(parent);
        let row_id = inv.modified.iter().next().unwrap();
        assert_eq!(row_id.table, PARENT_INVAL);
        assert_eq!(row_id.id, parent);
    }
}
