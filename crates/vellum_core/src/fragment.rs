//! Session-bound row wrappers with lifecycle state and dirty tracking.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use vellum_mapper::{Row, RowData, RowId, RowUpdate, StoreError, StoreResult, Value};
use vellum_model::DocId;

/// Lifecycle state of a [`Fragment`].
///
/// ```text
/// Absent ──put──> Created ──flush──> Pristine <──refetch── Invalidated*
///                                     │  └──put──> Modified ──flush──> Pristine
///                                     └──invalidation──> Invalidated*
/// any ──remove──> Deleted ──flush──> Detached
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Known not to exist in the database; becomes `Created` on first
    /// write.
    Absent,
    /// New, to be inserted at next flush.
    Created,
    /// Identical to the database row.
    Pristine,
    /// Holds unflushed changes.
    Modified,
    /// Marked for deletion at next flush.
    Deleted,
    /// No longer attached to any context.
    Detached,
    /// Another session modified the row; data is stale and must be
    /// refetched before use.
    InvalidatedModified,
    /// Another session deleted the row.
    InvalidatedDeleted,
}

impl State {
    /// Whether a transition from `self` to `to` is legal.
    #[must_use]
    pub fn can_transition(self, to: State) -> bool {
        use State::*;
        match to {
            Created => matches!(self, Absent),
            Modified => matches!(self, Pristine | Modified),
            Pristine => matches!(
                self,
                Created | Modified | Pristine | InvalidatedModified | InvalidatedDeleted
            ),
            Absent => matches!(self, Absent | InvalidatedModified | InvalidatedDeleted),
            InvalidatedModified => {
                matches!(self, Pristine | Absent | Modified | InvalidatedModified)
            }
            InvalidatedDeleted => {
                matches!(
                    self,
                    Pristine | Absent | Modified | InvalidatedModified | InvalidatedDeleted
                )
            }
            Deleted => !matches!(self, Deleted | Detached),
            Detached => true,
        }
    }

    /// Whether the fragment's data is stale and needs a refetch.
    #[must_use]
    pub fn is_invalidated(self) -> bool {
        matches!(self, State::InvalidatedModified | State::InvalidatedDeleted)
    }
}

/// A fragment shared between the context maps, selections and nodes.
pub type FragmentRef = Arc<RwLock<Fragment>>;

/// The payload of a fragment, with its dirty-tracking state.
#[derive(Debug, Clone)]
pub enum FragmentData {
    /// A single row with per-key dirtiness.
    Simple {
        /// Current column values.
        values: BTreeMap<String, Value>,
        /// Shadow copy of the pre-change value of each touched key,
        /// kept so a write that restores the old value un-dirties the
        /// key.
        old_values: BTreeMap<String, Value>,
        /// Keys whose value differs from the database row.
        dirty_keys: BTreeSet<String>,
    },
    /// A collection row with whole-array dirtiness.
    Collection {
        /// Current array.
        values: Vec<Value>,
        /// Whether the array differs from the database rows. Flush is a
        /// full delete + reinsert.
        dirty: bool,
    },
}

/// An in-memory, session-bound representation of one database row (or
/// row-set) with state tracking.
///
/// Fragments hold no reference back to their owning context; the
/// [`PersistenceContext`](crate::PersistenceContext) keeps them in its
/// own maps and performs all membership bookkeeping when a mutation
/// reports a state change.
pub struct Fragment {
    row_id: RowId,
    state: State,
    data: FragmentData,
}

impl Fragment {
    /// Wraps a fetched or newly built row.
    #[must_use]
    pub fn from_row(row: Row, state: State) -> Self {
        let data = match row.data {
            RowData::Map(values) => FragmentData::Simple {
                values,
                old_values: BTreeMap::new(),
                dirty_keys: BTreeSet::new(),
            },
            RowData::Array(values) => FragmentData::Collection {
                values,
                dirty: false,
            },
        };
        Self {
            row_id: row.id,
            state,
            data,
        }
    }

    /// Creates an absent simple fragment.
    #[must_use]
    pub fn absent_simple(row_id: RowId) -> Self {
        Self {
            row_id,
            state: State::Absent,
            data: FragmentData::Simple {
                values: BTreeMap::new(),
                old_values: BTreeMap::new(),
                dirty_keys: BTreeSet::new(),
            },
        }
    }

    /// Creates an absent collection fragment.
    #[must_use]
    pub fn absent_collection(row_id: RowId) -> Self {
        Self {
            row_id,
            state: State::Absent,
            data: FragmentData::Collection {
                values: Vec::new(),
                dirty: false,
            },
        }
    }

    /// Wraps into a shareable reference.
    #[must_use]
    pub fn into_ref(self) -> FragmentRef {
        Arc::new(RwLock::new(self))
    }

    /// The row identity.
    #[must_use]
    pub fn row_id(&self) -> &RowId {
        &self.row_id
    }

    /// The row id.
    #[must_use]
    pub fn id(&self) -> DocId {
        self.row_id.id
    }

    /// The table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.row_id.table
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether this wraps a collection row.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self.data, FragmentData::Collection { .. })
    }

    fn transition(&mut self, to: State) -> StoreResult<()> {
        if !self.state.can_transition(to) {
            return Err(StoreError::invalid_state(format!(
                "illegal fragment transition {:?} -> {to:?} on {}",
                self.state, self.row_id
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Marks the fragment flushed; dirty state is cleared and deltas are
    /// resolved to the values the database now holds.
    pub fn set_pristine(&mut self) -> StoreResult<()> {
        self.transition(State::Pristine)?;
        self.clear_dirty();
        Ok(())
    }

    /// Marks the fragment deleted.
    pub fn set_deleted(&mut self) -> StoreResult<()> {
        self.transition(State::Deleted)
    }

    /// Detaches the fragment from its context.
    pub fn set_detached(&mut self) -> StoreResult<()> {
        self.transition(State::Detached)
    }

    /// Marks the fragment stale after a concurrent modification.
    pub fn set_invalidated_modified(&mut self) -> StoreResult<()> {
        self.transition(State::InvalidatedModified)
    }

    /// Marks the fragment stale after a concurrent deletion.
    pub fn set_invalidated_deleted(&mut self) -> StoreResult<()> {
        self.transition(State::InvalidatedDeleted)
    }

    /// Reads a column value; `Null` when unset.
    #[must_use]
    pub fn get(&self, key: &str) -> Value {
        match &self.data {
            FragmentData::Simple { values, .. } => {
                values.get(key).cloned().unwrap_or(Value::Null)
            }
            FragmentData::Collection { .. } => Value::Null,
        }
    }

    /// Reads a string column.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).as_str().map(str::to_owned)
    }

    /// Reads an id column.
    #[must_use]
    pub fn get_id(&self, key: &str) -> Option<DocId> {
        self.get(key).as_id()
    }

    /// Reads a long column, resolving deltas.
    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.get(key).as_long()
    }

    /// Whether a boolean column is true.
    #[must_use]
    pub fn is_true(&self, key: &str) -> bool {
        self.get(key).is_true()
    }

    /// Writes a column value.
    ///
    /// Returns `true` when the write changed the fragment's state from a
    /// pristine-map state to a modified-map state (`Pristine ->
    /// Modified` or `Absent -> Created`), in which case the owning
    /// context must move it between its maps.
    ///
    /// Counter deltas combine: putting a delta over an existing delta on
    /// the same key yields one delta whose increment is the sum. A write
    /// whose full value equals the current full value is elided and does
    /// not dirty the key.
    pub fn put(&mut self, key: &str, value: Value) -> StoreResult<bool> {
        match self.state {
            State::Deleted | State::Detached => {
                return Err(StoreError::invalid_state(format!(
                    "write to {:?} fragment {}",
                    self.state, self.row_id
                )))
            }
            State::InvalidatedModified | State::InvalidatedDeleted => {
                return Err(StoreError::invalid_state(format!(
                    "write to invalidated fragment {}; refetch first",
                    self.row_id
                )))
            }
            _ => {}
        }
        let FragmentData::Simple {
            values,
            old_values,
            dirty_keys,
        } = &mut self.data
        else {
            return Err(StoreError::invalid_state(format!(
                "keyed write to collection fragment {}",
                self.row_id
            )));
        };

        let current = values.get(key).cloned().unwrap_or(Value::Null);
        let new_value = match (&current, value) {
            // combine deltas so one update carries the summed increment
            (Value::Delta(old), Value::Delta(new)) => Value::Delta(old.add(new)),
            (_, value) => value,
        };
        if current.same_stored(&new_value) {
            return Ok(false);
        }

        old_values
            .entry(key.to_owned())
            .or_insert_with(|| current.clone());
        values.insert(key.to_owned(), new_value);
        // a write restoring the original value un-dirties the key
        let reverted = old_values
            .get(key)
            .is_some_and(|old| old.same_stored(&values[key]));
        if reverted {
            dirty_keys.remove(key);
        } else {
            dirty_keys.insert(key.to_owned());
        }

        self.mark_modified()
    }

    /// The collection array.
    #[must_use]
    pub fn array(&self) -> &[Value] {
        match &self.data {
            FragmentData::Collection { values, .. } => values,
            FragmentData::Simple { .. } => &[],
        }
    }

    /// Replaces the collection array; any change dirties the whole
    /// collection.
    pub fn set_array(&mut self, new_values: Vec<Value>) -> StoreResult<bool> {
        match self.state {
            State::Deleted | State::Detached => {
                return Err(StoreError::invalid_state(format!(
                    "write to {:?} fragment {}",
                    self.state, self.row_id
                )))
            }
            State::InvalidatedModified | State::InvalidatedDeleted => {
                return Err(StoreError::invalid_state(format!(
                    "write to invalidated fragment {}; refetch first",
                    self.row_id
                )))
            }
            _ => {}
        }
        let FragmentData::Collection { values, dirty } = &mut self.data else {
            return Err(StoreError::invalid_state(format!(
                "array write to simple fragment {}",
                self.row_id
            )));
        };
        if *values == new_values {
            return Ok(false);
        }
        *values = new_values;
        *dirty = true;
        self.mark_modified()
    }

    fn mark_modified(&mut self) -> StoreResult<bool> {
        match self.state {
            State::Absent => {
                self.transition(State::Created)?;
                Ok(true)
            }
            State::Pristine => {
                self.transition(State::Modified)?;
                Ok(true)
            }
            State::Created | State::Modified => Ok(false),
            other => Err(StoreError::invalid_state(format!(
                "cannot modify fragment in state {other:?}"
            ))),
        }
    }

    /// The keys currently dirty.
    #[must_use]
    pub fn dirty_keys(&self) -> Vec<String> {
        match &self.data {
            FragmentData::Simple { dirty_keys, .. } => dirty_keys.iter().cloned().collect(),
            FragmentData::Collection { .. } => Vec::new(),
        }
    }

    /// Whether any unflushed change is recorded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        match &self.data {
            FragmentData::Simple { dirty_keys, .. } => !dirty_keys.is_empty(),
            FragmentData::Collection { dirty, .. } => *dirty,
        }
    }

    /// Builds the row for an insert.
    #[must_use]
    pub fn to_row(&self) -> Row {
        let data = match &self.data {
            FragmentData::Simple { values, .. } => RowData::Map(values.clone()),
            FragmentData::Collection { values, .. } => RowData::Array(values.clone()),
        };
        Row {
            id: self.row_id.clone(),
            data,
        }
    }

    /// Builds the update carrying only the dirty part, `None` when
    /// nothing is dirty.
    #[must_use]
    pub fn row_update(&self) -> Option<RowUpdate> {
        match &self.data {
            FragmentData::Simple { values, dirty_keys, .. } => {
                if dirty_keys.is_empty() {
                    return None;
                }
                let mut row_values = BTreeMap::new();
                for key in dirty_keys {
                    row_values
                        .insert(key.clone(), values.get(key).cloned().unwrap_or(Value::Null));
                }
                Some(RowUpdate::for_keys(
                    Row {
                        id: self.row_id.clone(),
                        data: RowData::Map(row_values),
                    },
                    dirty_keys.iter().cloned().collect(),
                ))
            }
            FragmentData::Collection { dirty, .. } => {
                if !*dirty {
                    return None;
                }
                Some(RowUpdate::whole(self.to_row()))
            }
        }
    }

    /// Clears dirty tracking and resolves deltas to the full values the
    /// database holds after a flush.
    pub fn clear_dirty(&mut self) {
        match &mut self.data {
            FragmentData::Simple {
                values,
                old_values,
                dirty_keys,
            } => {
                for value in values.values_mut() {
                    if let Value::Delta(d) = value {
                        *value = Value::Long(d.full_value());
                    }
                }
                old_values.clear();
                dirty_keys.clear();
            }
            FragmentData::Collection { dirty, .. } => {
                *dirty = false;
            }
        }
    }

    /// Replaces the payload with freshly fetched data.
    ///
    /// Used when an invalidated fragment is accessed again: `Some` data
    /// makes it pristine, `None` makes it absent.
    pub fn refetched(&mut self, data: Option<RowData>) -> StoreResult<()> {
        match data {
            Some(RowData::Map(values)) => {
                self.data = FragmentData::Simple {
                    values,
                    old_values: BTreeMap::new(),
                    dirty_keys: BTreeSet::new(),
                };
                self.transition(State::Pristine)
            }
            Some(RowData::Array(values)) => {
                self.data = FragmentData::Collection {
                    values,
                    dirty: false,
                };
                self.transition(State::Pristine)
            }
            None => {
                self.data = match self.data {
                    FragmentData::Simple { .. } => FragmentData::Simple {
                        values: BTreeMap::new(),
                        old_values: BTreeMap::new(),
                        dirty_keys: BTreeSet::new(),
                    },
                    FragmentData::Collection { .. } => FragmentData::Collection {
                        values: Vec::new(),
                        dirty: false,
                    },
                };
                self.transition(State::Absent)
            }
        }
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("row_id", &self.row_id)
            .field("state", &self.state)
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_mapper::DeltaLong;
    use vellum_model::HIER_TABLE;

    fn pristine_simple() -> Fragment {
        let id = DocId::new();
        let mut row = Row::new(HIER_TABLE, id);
        row.put("name", Value::from("doc"));
        row.put("count", Value::Long(10));
        Fragment::from_row(row, State::Pristine)
    }

    #[test]
    fn put_dirties_and_reports_map_move() {
        let mut fragment = pristine_simple();
        let moved = fragment.put("name", Value::from("renamed")).unwrap();
        assert!(moved);
        assert_eq!(fragment.state(), State::Modified);
        assert_eq!(fragment.dirty_keys(), vec!["name".to_owned()]);

        // further writes don't report another move
        let moved = fragment.put("count", Value::Long(11)).unwrap();
        assert!(!moved);
    }

    #[test]
    fn redundant_put_is_elided() {
        let mut fragment = pristine_simple();
        let moved = fragment.put("name", Value::from("doc")).unwrap();
        assert!(!moved);
        assert_eq!(fragment.state(), State::Pristine);
        assert!(!fragment.is_dirty());
    }

    #[test]
    fn restoring_old_value_undirties_key() {
        let mut fragment = pristine_simple();
        fragment.put("name", Value::from("renamed")).unwrap();
        fragment.put("name", Value::from("doc")).unwrap();
        assert!(!fragment.is_dirty());
        // state stays modified until flush; only the diff is empty
        assert_eq!(fragment.state(), State::Modified);
        assert!(fragment.row_update().is_none());
    }

    #[test]
    fn deltas_combine_into_one() {
        let mut fragment = pristine_simple();
        fragment
            .put("count", Value::Delta(DeltaLong::new(10, 3)))
            .unwrap();
        fragment
            .put("count", Value::Delta(DeltaLong::new(13, 4)))
            .unwrap();
        assert_eq!(
            fragment.get("count"),
            Value::Delta(DeltaLong::new(10, 7))
        );
        assert_eq!(fragment.get_long("count"), Some(17));

        // the update carries the combined delta for the database to
        // apply as col = col + 7
        let update = fragment.row_update().unwrap();
        assert_eq!(update.keys.as_deref(), Some(&["count".to_owned()][..]));
    }

    #[test]
    fn clear_dirty_resolves_deltas() {
        let mut fragment = pristine_simple();
        fragment
            .put("count", Value::Delta(DeltaLong::new(10, 5)))
            .unwrap();
        fragment.set_pristine().unwrap();
        assert_eq!(fragment.get("count"), Value::Long(15));
        assert!(!fragment.is_dirty());
    }

    #[test]
    fn absent_becomes_created_on_write() {
        let id = DocId::new();
        let mut fragment = Fragment::absent_simple(RowId::new(HIER_TABLE, id));
        assert_eq!(fragment.state(), State::Absent);
        let moved = fragment.put("name", Value::from("new")).unwrap();
        assert!(moved);
        assert_eq!(fragment.state(), State::Created);
    }

    #[test]
    fn collection_write_dirties_whole_array() {
        let id = DocId::new();
        let row = Row::new_array("contributors", id, vec![Value::from("a")]);
        let mut fragment = Fragment::from_row(row, State::Pristine);

        // identical array is elided
        let moved = fragment.set_array(vec![Value::from("a")]).unwrap();
        assert!(!moved);
        assert_eq!(fragment.state(), State::Pristine);

        let moved = fragment
            .set_array(vec![Value::from("a"), Value::from("b")])
            .unwrap();
        assert!(moved);
        assert!(fragment.is_dirty());
        let update = fragment.row_update().unwrap();
        assert!(update.keys.is_none());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut fragment = pristine_simple();
        fragment.set_deleted().unwrap();
        assert!(fragment.set_pristine().is_err());
        assert!(fragment.put("name", Value::from("x")).is_err());
        // deleted flows to detached at flush
        fragment.set_detached().unwrap();
        assert!(fragment.set_deleted().is_err());
    }

    #[test]
    fn invalidated_fragment_rejects_writes() {
        let mut fragment = pristine_simple();
        fragment.set_invalidated_modified().unwrap();
        assert!(fragment.put("name", Value::from("x")).is_err());

        fragment
            .refetched(Some(RowData::Map(BTreeMap::from([(
                "name".to_owned(),
                Value::from("fresh"),
            )]))))
            .unwrap();
        assert_eq!(fragment.state(), State::Pristine);
        assert_eq!(fragment.get_string("name").as_deref(), Some("fresh"));
    }

    #[test]
    fn refetch_of_deleted_row_becomes_absent() {
        let mut fragment = pristine_simple();
        fragment.set_invalidated_deleted().unwrap();
        fragment.refetched(None).unwrap();
        assert_eq!(fragment.state(), State::Absent);
        assert_eq!(fragment.get("name"), Value::Null);
    }
}
