//! The mapper trait: the boundary to actual database I/O.

use crate::error::StoreResult;
use crate::invalidations::Invalidations;
use crate::row::{Row, RowBatch, RowId};
use crate::value::Value;
use vellum_model::{
    DocId, HIER_TABLE, PROXY_TABLE, VERSION_TABLE, HIER_IS_PROPERTY_KEY, HIER_NAME_KEY,
    HIER_PARENT_KEY, PROXY_TARGET_KEY, PROXY_VERSIONABLE_KEY, VERSION_VERSIONABLE_KEY,
};

/// Result of reading one row id: the row, or a confirmed absence.
///
/// Absence markers are first-class so that negative lookups can be
/// cached; "we asked and there was nothing" is information.
#[derive(Debug, Clone, PartialEq)]
pub enum RowRead {
    /// The row exists with this data.
    Found(Row),
    /// The row id was queried and does not exist.
    Absent(RowId),
}

impl RowRead {
    /// The row id of either variant.
    #[must_use]
    pub fn row_id(&self) -> &RowId {
        match self {
            Self::Found(row) => &row.id,
            Self::Absent(row_id) => row_id,
        }
    }
}

/// The fixed set of selection queries the core issues.
///
/// A selection is "all rows of one table matching a fixed clause"; the
/// core caches the complete answer per selection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionType {
    /// Regular children of a parent (documents).
    ChildrenRegular,
    /// Complex-property children of a parent.
    ChildrenComplex,
    /// Versions of a version series.
    SeriesVersions,
    /// Proxies of a version series.
    SeriesProxies,
    /// Proxies pointing at a target.
    TargetProxies,
}

impl SelectionType {
    /// The table the selection reads.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::ChildrenRegular | Self::ChildrenComplex => HIER_TABLE,
            Self::SeriesVersions => VERSION_TABLE,
            Self::SeriesProxies | Self::TargetProxies => PROXY_TABLE,
        }
    }

    /// The column holding the selection id.
    #[must_use]
    pub fn selection_key(self) -> &'static str {
        match self {
            Self::ChildrenRegular | Self::ChildrenComplex => HIER_PARENT_KEY,
            Self::SeriesVersions => VERSION_VERSIONABLE_KEY,
            Self::SeriesProxies => PROXY_VERSIONABLE_KEY,
            Self::TargetProxies => PROXY_TARGET_KEY,
        }
    }

    /// An optional column the caller may filter results by.
    #[must_use]
    pub fn filter_key(self) -> Option<&'static str> {
        match self {
            Self::ChildrenRegular | Self::ChildrenComplex => Some(HIER_NAME_KEY),
            _ => None,
        }
    }

    /// A fixed extra criterion on the selection's table.
    #[must_use]
    pub fn criterion(self) -> Option<(&'static str, Value)> {
        match self {
            Self::ChildrenRegular => Some((HIER_IS_PROPERTY_KEY, Value::Bool(false))),
            Self::ChildrenComplex => Some((HIER_IS_PROPERTY_KEY, Value::Bool(true))),
            _ => None,
        }
    }

    /// The pseudo table name under which "this selection's id set
    /// changed" invalidations travel.
    #[must_use]
    pub fn invalidation_table(self) -> &'static str {
        match self {
            Self::ChildrenRegular | Self::ChildrenComplex => crate::PARENT_INVAL,
            Self::SeriesVersions => "__SERIESVERSIONS__",
            Self::SeriesProxies => "__SERIESPROXIES__",
            Self::TargetProxies => "__TARGETPROXIES__",
        }
    }
}

/// A node id with the type information needed to enumerate its
/// fragments without further reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdWithTypes {
    /// The node id.
    pub id: DocId,
    /// The node's primary type.
    pub primary_type: String,
}

impl IdWithTypes {
    /// Creates an id-with-types.
    pub fn new(id: DocId, primary_type: impl Into<String>) -> Self {
        Self {
            id,
            primary_type: primary_type.into(),
        }
    }
}

/// Everything a cache needs to know about one removed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node id.
    pub id: DocId,
    /// Parent id, `None` for a root.
    pub parent_id: Option<DocId>,
    /// Primary type of the node.
    pub primary_type: String,
    /// Whether the node was a complex property.
    pub is_property: bool,
    /// For versions and proxies, the version series id.
    pub version_series_id: Option<DocId>,
    /// For proxies, the proxy target id.
    pub target_id: Option<DocId>,
}

/// Result of a deep hierarchy copy.
#[derive(Debug, Clone)]
pub struct CopyResult {
    /// Id of the copy's root.
    pub copy_id: DocId,
    /// Invalidations generated by the copy, to mark locally and forward
    /// to other sessions.
    pub invalidations: Invalidations,
    /// Ids of proxies contained in the copied subtree.
    pub proxy_ids: Vec<DocId>,
}

/// A document lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// The lock owner.
    pub owner: String,
    /// Milliseconds since the Unix epoch at creation.
    pub created: i64,
    /// Marks the result of a failed removal attempt: the lock is still
    /// in place and belongs to `owner`.
    pub failed: bool,
}

impl Lock {
    /// Creates a lock owned by `owner`, created now.
    pub fn new(owner: impl Into<String>, created: i64) -> Self {
        Self {
            owner: owner.into(),
            created,
            failed: false,
        }
    }

    /// Returns a copy marked as a failed removal.
    #[must_use]
    pub fn as_failed(&self) -> Self {
        Self {
            failed: true,
            ..self.clone()
        }
    }
}

/// Abstracts the actual database reads and writes.
///
/// Every method is a synchronous, blocking round-trip. Implementations
/// are shared between a session and its caches, so they take `&self` and
/// handle their own interior locking.
///
/// Writes are write-through: when [`RowMapper::write`] returns, the
/// underlying store has the data.
pub trait RowMapper: Send + Sync {
    /// Reads a set of rows; every input id yields exactly one
    /// [`RowRead`], in no particular order.
    ///
    /// With `cache_only`, implementations answer from memory and report
    /// anything else as absent without touching the database.
    fn read(&self, row_ids: &[RowId], cache_only: bool) -> StoreResult<Vec<RowRead>>;

    /// Reads one single row.
    fn read_simple_row(&self, row_id: &RowId) -> StoreResult<Option<Row>>;

    /// Reads one collection row's array.
    fn read_collection_array(&self, row_id: &RowId) -> StoreResult<Option<Row>>;

    /// Reads the rows of a selection, optionally filtered by one column
    /// value (used for single-child-by-name lookups that must not pay
    /// for the whole selection).
    fn read_selection_rows(
        &self,
        selection: SelectionType,
        selection_id: DocId,
        filter: Option<(&str, &Value)>,
    ) -> StoreResult<Vec<Row>>;

    /// Writes a batch: creates, then updates, then deletes.
    fn write(&self, batch: &RowBatch) -> StoreResult<()>;

    /// Deep-copies the hierarchy under `source`.
    ///
    /// With a destination parent, the whole subtree is copied and filed
    /// under it with `name`. With `dest_parent_id == None` the copy is a
    /// checkin-style snapshot: unfiled, and regular (non-property)
    /// children are excluded. `overwrite_row` overwrites an existing
    /// hierarchy row instead of creating one (version restore); its
    /// [`Value::Opaque`] columns are left untouched.
    fn copy(
        &self,
        source: &IdWithTypes,
        dest_parent_id: Option<DocId>,
        dest_name: Option<&str>,
        overwrite_row: Option<&Row>,
    ) -> StoreResult<CopyResult>;

    /// Removes a node and all its descendants, returning info for every
    /// removed node (the root included) so callers can fix their caches.
    fn remove(&self, root_info: &NodeInfo) -> StoreResult<Vec<NodeInfo>>;

    /// Reads the lock row for a document.
    fn get_lock(&self, id: DocId) -> StoreResult<Option<Lock>>;

    /// Inserts a lock row; returns the existing lock without writing when
    /// the document is already locked.
    ///
    /// Two nodes racing to insert the same lock row resolve the race by
    /// unique constraint: the loser gets a
    /// [`StoreError::ConcurrentUpdate`](crate::StoreError::ConcurrentUpdate).
    fn set_lock(&self, id: DocId, lock: &Lock) -> StoreResult<Option<Lock>>;

    /// Deletes the lock row for a document, returning the old lock.
    fn remove_lock(&self, id: DocId) -> StoreResult<Option<Lock>>;

    /// Starts a transaction.
    fn begin(&self) -> StoreResult<()>;

    /// Commits the current transaction.
    fn commit(&self) -> StoreResult<()>;

    /// Rolls back the current transaction.
    fn rollback(&self) -> StoreResult<()>;

    /// Hands invalidations gathered by the session to the mapper for
    /// propagation at commit.
    fn send_invalidations(&self, invalidations: &Invalidations) -> StoreResult<()>;

    /// Returns the invalidations other sessions addressed to this
    /// mapper since the last call, after applying them to any cache the
    /// mapper manages.
    fn receive_invalidations(&self) -> StoreResult<Option<Invalidations>>;

    /// Drops any cache the mapper manages.
    fn clear_cache(&self);

    /// Number of cached entries, 0 for uncached mappers.
    fn cache_size(&self) -> usize;
}
