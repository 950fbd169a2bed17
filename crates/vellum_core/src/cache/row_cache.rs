//! The bounded row cache shared by the caching mappers.

use crate::lru::LruMap;
use crate::stats::CacheStats;
use parking_lot::Mutex;
use std::sync::Arc;
use vellum_mapper::{Invalidations, Row, RowData, RowId, RowUpdate, Value};
use vellum_model::Model;

/// A cache entry: either the real row, or a confirmed absence.
///
/// Caching negative lookups matters: "we asked the database and the row
/// does not exist" saves the same round-trip as a positive hit.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedRow {
    /// The row exists with this data.
    Row(Row),
    /// The row is known not to exist.
    Absent,
}

/// A bounded LRU of rows and absence markers.
///
/// Replaces the memory-sensitive (GC-driven) cache of classic designs
/// with an explicit capacity whose eviction tests can force
/// deterministically.
pub struct RowCache {
    model: Arc<Model>,
    entries: Mutex<LruMap<RowId, CachedRow>>,
    stats: CacheStats,
}

impl RowCache {
    /// Creates a cache bounded to `capacity` rows.
    #[must_use]
    pub fn new(model: Arc<Model>, capacity: usize) -> Self {
        Self {
            model,
            entries: Mutex::new(LruMap::new(capacity)),
            stats: CacheStats::new(),
        }
    }

    /// Looks up a row, promoting it to most recently used.
    #[must_use]
    pub fn get(&self, row_id: &RowId) -> Option<CachedRow> {
        self.stats.record_lookup();
        let hit = self.entries.lock().get(row_id).cloned();
        if hit.is_some() {
            self.stats.record_hit();
        }
        hit
    }

    /// Caches a row.
    ///
    /// Position-ordered collections (ACLs) are re-sorted on insert so a
    /// cached read reproduces the same `ORDER BY pos` the database would
    /// have given; security checks reading from cache or from a fresh
    /// query must see the same effective order.
    pub fn put_row(&self, mut row: Row) {
        if self.model.is_pos_ordered_collection(&row.id.table) {
            if let RowData::Array(values) = &mut row.data {
                values.sort_by_key(|value| match value {
                    Value::Acl(entry) => entry.pos.unwrap_or(i64::MAX),
                    _ => i64::MAX,
                });
            }
        }
        let row_id = row.id.clone();
        self.entries.lock().insert(row_id, CachedRow::Row(row));
    }

    /// Caches a confirmed absence.
    pub fn put_absent(&self, row_id: RowId) {
        self.entries.lock().insert(row_id, CachedRow::Absent);
    }

    /// Merges an update into the cached copy, if any.
    ///
    /// A partial update can only be applied to a cached full row; when
    /// the row is not cached the entry is simply dropped and the next
    /// read repopulates it.
    pub fn apply_update(&self, update: &RowUpdate) {
        let mut entries = self.entries.lock();
        let row_id = &update.row.id;
        let mut drop_entry = false;
        match entries.get_mut(row_id) {
            None => {}
            Some(CachedRow::Row(cached)) => {
                match (&mut cached.data, &update.row.data, &update.keys) {
                    (RowData::Map(cached_map), RowData::Map(new), Some(keys)) => {
                        for key in keys {
                            let value = new.get(key).cloned().unwrap_or(Value::Null);
                            match value {
                                Value::Opaque => {}
                                Value::Delta(d) => {
                                    let applied =
                                        match cached_map.get(key).and_then(Value::as_long) {
                                            Some(current) => current + d.delta,
                                            None => d.full_value(),
                                        };
                                    cached_map.insert(key.clone(), Value::Long(applied));
                                }
                                value => {
                                    cached_map.insert(key.clone(), value);
                                }
                            }
                        }
                    }
                    (RowData::Array(cached_values), RowData::Array(new), None) => {
                        *cached_values = new.clone();
                    }
                    _ => drop_entry = true,
                }
            }
            // an update to a row we cached as absent: stale knowledge
            Some(CachedRow::Absent) => drop_entry = true,
        }
        if drop_entry {
            entries.remove(row_id);
        }
    }

    /// Evicts one row.
    pub fn evict(&self, row_id: &RowId) {
        self.entries.lock().remove(row_id);
    }

    /// Applies received invalidations: modified rows are evicted (their
    /// new content is unknown), deleted rows become cached absences.
    pub fn apply_invalidations(&self, invalidations: &Invalidations) {
        if invalidations.all {
            self.clear();
            return;
        }
        let mut entries = self.entries.lock();
        for row_id in &invalidations.modified {
            entries.remove(row_id);
        }
        for row_id in &invalidations.deleted {
            entries.insert(row_id.clone(), CachedRow::Absent);
        }
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup statistics.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_mapper::AclEntry;
    use vellum_model::{DocId, ModelBuilder, ACL_TABLE, HIER_TABLE};

    fn cache(capacity: usize) -> RowCache {
        RowCache::new(Arc::new(ModelBuilder::new().build()), capacity)
    }

    fn acl(pos: Option<i64>, user: &str) -> Value {
        Value::Acl(Box::new(AclEntry {
            pos,
            user: user.to_owned(),
            permission: "Read".to_owned(),
            grant: true,
        }))
    }

    #[test]
    fn positive_and_negative_entries() {
        let cache = cache(16);
        let id = DocId::new();
        let row_id = RowId::new(HIER_TABLE, id);

        assert!(cache.get(&row_id).is_none());
        cache.put_row(Row::new(HIER_TABLE, id));
        assert!(matches!(cache.get(&row_id), Some(CachedRow::Row(_))));

        let absent_id = RowId::new(HIER_TABLE, DocId::new());
        cache.put_absent(absent_id.clone());
        assert_eq!(cache.get(&absent_id), Some(CachedRow::Absent));
    }

    #[test]
    fn acl_rows_resort_by_pos_on_insert() {
        let cache = cache(16);
        let id = DocId::new();
        let row = Row::new_array(
            ACL_TABLE,
            id,
            vec![acl(Some(2), "b"), acl(None, "z"), acl(Some(1), "a")],
        );
        cache.put_row(row);

        let Some(CachedRow::Row(cached)) = cache.get(&RowId::new(ACL_TABLE, id)) else {
            panic!("row not cached");
        };
        let users: Vec<&str> = cached
            .array()
            .unwrap()
            .iter()
            .map(|v| match v {
                Value::Acl(e) => e.user.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(users, vec!["a", "b", "z"]);
    }

    #[test]
    fn invalidations_evict_modified_and_mark_deleted_absent() {
        let cache = cache(16);
        let modified = DocId::new();
        let deleted = DocId::new();
        cache.put_row(Row::new(HIER_TABLE, modified));
        cache.put_row(Row::new(HIER_TABLE, deleted));

        let mut inv = Invalidations::new();
        inv.add_modified(RowId::new(HIER_TABLE, modified));
        inv.add_deleted(RowId::new(HIER_TABLE, deleted));
        cache.apply_invalidations(&inv);

        assert!(cache.get(&RowId::new(HIER_TABLE, modified)).is_none());
        assert_eq!(
            cache.get(&RowId::new(HIER_TABLE, deleted)),
            Some(CachedRow::Absent)
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let cache = cache(2);
        for _ in 0..5 {
            cache.put_row(Row::new(HIER_TABLE, DocId::new()));
        }
        assert_eq!(cache.len(), 2);
    }
}
