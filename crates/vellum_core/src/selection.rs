//! Per-selection-id caches of "all rows matching a fixed clause".
//!
//! A [`Selection`] caches the answer to one selection query (all
//! children of parent X, all versions of series S, ...). Its id set is
//! split three ways:
//! - `existing`: confirmed in the database
//! - `created`: pending insert, unflushed
//! - `deleted`: pending removal, unflushed
//!
//! A clean selection (no pending create/delete) is redundant with the
//! database and lives in an evictable map; the moment it gains a delta
//! it is promoted to a hard map until flushed, because that delta is the
//! only record of the pending change.

use crate::fragment::Fragment;
use crate::lru::LruMap;
use std::collections::{HashMap, HashSet};
use vellum_mapper::{Invalidations, RowId, SelectionType};
use vellum_model::DocId;

/// Three-state result of a selection lookup.
///
/// `Unknown` is not `Absent`: it means the cache has no complete
/// information and the caller must go to the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionLookup {
    /// The value resolves to this id.
    Found(DocId),
    /// Completeness is established and the value genuinely has no match.
    Absent,
    /// The cache cannot answer; query the mapper.
    Unknown,
}

/// Cached id set of one selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    existing: HashSet<DocId>,
    created: HashSet<DocId>,
    deleted: HashSet<DocId>,
    complete: bool,
}

impl Selection {
    /// An unknown (incomplete, empty) selection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A complete selection with no members; used for freshly created
    /// parents, which are known to have no children.
    #[must_use]
    pub fn new_empty_complete() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }

    /// Whether the full member set is known.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the selection holds pending creates or deletes.
    #[must_use]
    pub fn has_deltas(&self) -> bool {
        !self.created.is_empty() || !self.deleted.is_empty()
    }

    /// Records a member confirmed to exist in the database.
    ///
    /// Ignored while incomplete: a single known member adds nothing to
    /// an unknown set.
    pub fn add_existing(&mut self, id: DocId) {
        if self.complete && !self.deleted.contains(&id) {
            self.existing.insert(id);
        }
    }

    /// Records a pending, unflushed member.
    pub fn add_created(&mut self, id: DocId) {
        self.created.insert(id);
    }

    /// Establishes completeness from a full database read.
    ///
    /// Completeness is monotonic: once set, later full reads only merge
    /// in, and only an explicit invalidation forces the selection back
    /// to incomplete.
    pub fn add_existing_complete(&mut self, ids: impl IntoIterator<Item = DocId>) {
        for id in ids {
            if !self.deleted.contains(&id) && !self.created.contains(&id) {
                self.existing.insert(id);
            }
        }
        self.complete = true;
    }

    /// Records a removal.
    pub fn remove(&mut self, id: DocId) {
        if self.created.remove(&id) {
            return;
        }
        self.existing.remove(&id);
        self.deleted.insert(id);
    }

    /// Resolves deltas after a flush: creates become existing, deletes
    /// are forgotten.
    pub fn flush(&mut self) {
        if self.complete {
            self.existing.extend(self.created.drain());
        } else {
            self.created.clear();
        }
        self.deleted.clear();
    }

    /// Forces the selection back to incomplete, keeping its deltas.
    pub fn set_incomplete(&mut self) {
        self.complete = false;
        self.existing.clear();
    }

    /// All ids the cache can currently vouch for (existing and created).
    #[must_use]
    pub fn candidate_ids(&self) -> Vec<DocId> {
        self.existing
            .iter()
            .chain(self.created.iter())
            .copied()
            .collect()
    }

    /// The created (pending) ids.
    #[must_use]
    pub fn created_ids(&self) -> Vec<DocId> {
        self.created.iter().copied().collect()
    }

    /// The full member set, `None` while incomplete.
    #[must_use]
    pub fn complete_ids(&self) -> Option<Vec<DocId>> {
        if self.complete {
            Some(self.candidate_ids())
        } else {
            None
        }
    }
}

/// All cached [`Selection`]s of one type, with soft/hard promotion.
pub struct SelectionContext {
    selection_type: SelectionType,
    /// Clean selections; evictable because they are redundant with the
    /// database.
    soft: LruMap<DocId, Selection>,
    /// Selections holding pending deltas; survive until flushed.
    hard: HashMap<DocId, Selection>,
    /// Selection ids modified in this transaction, to be propagated as
    /// invalidations to other sessions at post-commit time.
    modified_in_transaction: HashSet<DocId>,
}

impl SelectionContext {
    /// Creates a selection context with the given clean-cache capacity.
    #[must_use]
    pub fn new(selection_type: SelectionType, cache_size: usize) -> Self {
        Self {
            selection_type,
            soft: LruMap::new(cache_size),
            hard: HashMap::new(),
            modified_in_transaction: HashSet::new(),
        }
    }

    /// The selection type served by this context.
    #[must_use]
    pub fn selection_type(&self) -> SelectionType {
        self.selection_type
    }

    /// Whether a hierarchy-or-other fragment belongs to this selection
    /// type (table and criterion match).
    #[must_use]
    pub fn applicable(&self, fragment: &Fragment) -> bool {
        if fragment.table() != self.selection_type.table() {
            return false;
        }
        match self.selection_type.criterion() {
            Some((key, value)) => fragment.get(key) == value,
            None => true,
        }
    }

    /// The selection id a fragment files under, `None` when unset (e.g.
    /// a root with no parent).
    #[must_use]
    pub fn selection_id_of(&self, fragment: &Fragment) -> Option<DocId> {
        fragment.get_id(self.selection_type.selection_key())
    }

    /// Looks up a selection without creating it.
    pub fn get(&mut self, selection_id: DocId) -> Option<&Selection> {
        if self.hard.contains_key(&selection_id) {
            return self.hard.get(&selection_id);
        }
        self.soft.get(&selection_id)
    }

    /// Runs `f` on the selection for `selection_id` (creating an
    /// unknown one if needed), then re-files it into the hard or soft
    /// map according to whether it now holds deltas.
    pub fn with_mut<R>(&mut self, selection_id: DocId, f: impl FnOnce(&mut Selection) -> R) -> R {
        let mut selection = self
            .hard
            .remove(&selection_id)
            .or_else(|| self.soft.remove(&selection_id))
            .unwrap_or_default();
        let result = f(&mut selection);
        if selection.has_deltas() {
            self.hard.insert(selection_id, selection);
        } else {
            self.soft.insert(selection_id, selection);
        }
        result
    }

    /// Records an existing member; with `invalidate`, other sessions
    /// will be told the selection changed.
    pub fn record_existing(&mut self, selection_id: DocId, member: DocId, invalidate: bool) {
        self.with_mut(selection_id, |sel| sel.add_existing(member));
        if invalidate {
            self.modified_in_transaction.insert(selection_id);
        }
    }

    /// Records a created (pending) member.
    pub fn record_created(&mut self, selection_id: DocId, member: DocId) {
        self.with_mut(selection_id, |sel| sel.add_created(member));
        self.modified_in_transaction.insert(selection_id);
    }

    /// Records a removed member.
    pub fn record_removed(&mut self, selection_id: DocId, member: DocId) {
        self.with_mut(selection_id, |sel| sel.remove(member));
        self.modified_in_transaction.insert(selection_id);
    }

    /// Primes an empty complete selection for a freshly created id.
    pub fn new_selection(&mut self, selection_id: DocId) {
        self.soft.insert(selection_id, Selection::new_empty_complete());
    }

    /// Drops the selection of a removed id entirely.
    pub fn record_removed_selection(&mut self, selection_id: DocId) {
        self.soft.remove(&selection_id);
        self.hard.remove(&selection_id);
    }

    /// Flushes after a save: deltas resolve and hard entries demote to
    /// the soft map.
    pub fn post_save(&mut self) {
        for (id, mut selection) in std::mem::take(&mut self.hard) {
            selection.flush();
            self.soft.insert(id, selection);
        }
    }

    /// Moves this context's pending selection invalidations into `out`.
    pub fn gather_invalidations(&mut self, out: &mut Invalidations) {
        let table = self.selection_type.invalidation_table();
        for id in self.modified_in_transaction.drain() {
            out.add_modified(RowId::new(table, id));
        }
    }

    /// Applies invalidations received from other sessions: affected
    /// selections are dropped.
    pub fn process_received_invalidations(&mut self, modified: &HashSet<RowId>) {
        let table = self.selection_type.invalidation_table();
        for row_id in modified {
            if row_id.table == table {
                self.soft.remove(&row_id.id);
                self.hard.remove(&row_id.id);
            }
        }
    }

    /// Marks invalidations generated by a mapper operation in this very
    /// session (copy, restore): selections lose completeness but keep
    /// their deltas, and the change propagates to others at commit.
    pub fn mark_invalidated(&mut self, modified: &HashSet<RowId>) {
        let table = self.selection_type.invalidation_table();
        for row_id in modified {
            if row_id.table != table {
                continue;
            }
            if self.hard.contains_key(&row_id.id) || self.soft.contains_key(&row_id.id) {
                self.with_mut(row_id.id, Selection::set_incomplete);
            }
            self.modified_in_transaction.insert(row_id.id);
        }
    }

    /// Drops the clean cache; selections holding deltas are kept, they
    /// are the only record of pending changes.
    pub fn clear_caches(&mut self) -> usize {
        let n = self.soft.len();
        self.soft.clear();
        self.modified_in_transaction.clear();
        n
    }

    /// Total number of cached selections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.soft.len() + self.hard.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SelectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionContext")
            .field("type", &self.selection_type)
            .field("soft", &self.soft.len())
            .field("hard", &self.hard.len())
            .finish_non_exhaustive()
    }
}
