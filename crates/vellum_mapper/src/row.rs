//! Raw row data units.

use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use vellum_model::DocId;

/// Identifies one logical row: a table name and an id.
///
/// Equality is by value; a `RowId` is the cache key throughout the
/// persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    /// Table (fragment) name.
    pub table: String,
    /// Row id.
    pub id: DocId,
}

impl RowId {
    /// Creates a row id.
    pub fn new(table: impl Into<String>, id: DocId) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.table, self.id)
    }
}

/// The payload of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowData {
    /// A single row with named columns.
    Map(BTreeMap<String, Value>),
    /// A collection flattened to a positional array.
    Array(Vec<Value>),
}

impl RowData {
    /// An empty single-row payload.
    #[must_use]
    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// An empty collection payload.
    #[must_use]
    pub fn empty_array() -> Self {
        Self::Array(Vec::new())
    }

    /// Whether this is a collection payload.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }
}

/// One row's worth of data, detached from any session state.
///
/// Cloning a row deep-copies its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// The row identity.
    pub id: RowId,
    /// The row payload.
    pub data: RowData,
}

impl Row {
    /// Creates an empty single row.
    pub fn new(table: impl Into<String>, id: DocId) -> Self {
        Self {
            id: RowId::new(table, id),
            data: RowData::empty_map(),
        }
    }

    /// Creates a collection row from an array.
    pub fn new_array(table: impl Into<String>, id: DocId, values: Vec<Value>) -> Self {
        Self {
            id: RowId::new(table, id),
            data: RowData::Array(values),
        }
    }

    /// Sets a column value on a single row.
    ///
    /// # Panics
    ///
    /// Panics if called on a collection row; that is a logic error at
    /// the call site, not a runtime condition.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        match &mut self.data {
            RowData::Map(map) => {
                map.insert(key.into(), value);
            }
            RowData::Array(_) => unreachable!("put on collection row"),
        }
        self
    }

    /// Reads a column value from a single row.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match &self.data {
            RowData::Map(map) => map.get(key),
            RowData::Array(_) => None,
        }
    }

    /// The positional values of a collection row.
    #[must_use]
    pub fn array(&self) -> Option<&[Value]> {
        match &self.data {
            RowData::Array(values) => Some(values),
            RowData::Map(_) => None,
        }
    }
}

/// An update to one row, carrying only what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    /// The row with its current values.
    pub row: Row,
    /// For single rows, the keys that are actually dirty; `None` means
    /// the whole payload is rewritten (collections).
    pub keys: Option<Vec<String>>,
}

impl RowUpdate {
    /// An update rewriting only the given keys of a single row.
    #[must_use]
    pub fn for_keys(row: Row, mut keys: Vec<String>) -> Self {
        keys.sort();
        Self {
            row,
            keys: Some(keys),
        }
    }

    /// A whole-payload rewrite (collection delete + reinsert).
    #[must_use]
    pub fn whole(row: Row) -> Self {
        Self { row, keys: None }
    }
}

/// The batched output of a unit of work, in execution order: creates,
/// then updates, then deletes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    /// Rows to insert; parents come before children so foreign keys
    /// resolve.
    pub creates: Vec<Row>,
    /// Rows to update.
    pub updates: Vec<RowUpdate>,
    /// Rows to delete.
    pub deletes: Vec<RowId>,
}

impl RowBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the batch contains no work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}
