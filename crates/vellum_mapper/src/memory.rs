//! In-memory mapper for testing and ephemeral repositories.

use crate::error::{StoreError, StoreResult};
use crate::invalidations::Invalidations;
use crate::mapper::{CopyResult, IdWithTypes, Lock, NodeInfo, RowMapper, RowRead, SelectionType};
use crate::row::{Row, RowBatch, RowData, RowId, RowUpdate};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vellum_model::{
    DocId, Model, HIER_IS_PROPERTY_KEY, HIER_NAME_KEY, HIER_PARENT_KEY, HIER_TABLE,
    LOCK_CREATED_KEY, LOCK_OWNER_KEY, LOCK_TABLE, MAIN_PRIMARY_TYPE_KEY, PROXY_TABLE,
    PROXY_TARGET_KEY, PROXY_TYPE, PROXY_VERSIONABLE_KEY, VERSION_TABLE, VERSION_VERSIONABLE_KEY,
};

/// An in-memory [`RowMapper`].
///
/// Stores every table as rows in one map and answers selection queries
/// by scanning. Suitable for:
/// - unit and integration tests
/// - ephemeral repositories that don't need persistence
///
/// Reads are counted so tests can assert that caches actually avoid
/// round-trips.
pub struct MemoryMapper {
    model: Arc<Model>,
    tables: Mutex<HashMap<RowId, RowData>>,
    read_count: AtomicU64,
    selection_read_count: AtomicU64,
    write_count: AtomicU64,
}

impl MemoryMapper {
    /// Creates an empty mapper over the given model.
    #[must_use]
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            tables: Mutex::new(HashMap::new()),
            read_count: AtomicU64::new(0),
            selection_read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }

    /// Number of row-read round-trips performed.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Number of selection-read round-trips performed.
    #[must_use]
    pub fn selection_read_count(&self) -> u64 {
        self.selection_read_count.load(Ordering::SeqCst)
    }

    /// Number of write batches executed.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Number of stored rows, across all tables.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Whether a row exists.
    #[must_use]
    pub fn has_row(&self, row_id: &RowId) -> bool {
        self.tables.lock().contains_key(row_id)
    }

    fn map_value(data: &RowData, key: &str) -> Value {
        match data {
            RowData::Map(map) => map.get(key).cloned().unwrap_or(Value::Null),
            RowData::Array(_) => Value::Null,
        }
    }

    fn hier_children(
        tables: &HashMap<RowId, RowData>,
        parent_id: DocId,
        properties_only: bool,
    ) -> Vec<DocId> {
        tables
            .iter()
            .filter(|(row_id, _)| row_id.table == HIER_TABLE)
            .filter(|(_, data)| {
                Self::map_value(data, HIER_PARENT_KEY).as_id() == Some(parent_id)
            })
            .filter(|(_, data)| {
                !properties_only || Self::map_value(data, HIER_IS_PROPERTY_KEY).is_true()
            })
            .map(|(row_id, _)| row_id.id)
            .collect()
    }

    /// Collects a subtree in parent-before-child order.
    fn collect_subtree(
        tables: &HashMap<RowId, RowData>,
        root: DocId,
        properties_only_below_root: bool,
    ) -> Vec<DocId> {
        let mut order = vec![root];
        let mut cursor = 0;
        while cursor < order.len() {
            let id = order[cursor];
            cursor += 1;
            order.extend(Self::hier_children(tables, id, properties_only_below_root));
        }
        order
    }

    fn apply_update(stored: &mut RowData, update: &RowUpdate) -> StoreResult<()> {
        match (&mut *stored, &update.row.data, &update.keys) {
            (RowData::Map(stored), RowData::Map(new), Some(keys)) => {
                for key in keys {
                    let value = new.get(key).cloned().unwrap_or(Value::Null);
                    match value {
                        Value::Opaque => {}
                        Value::Delta(d) => {
                            // database semantics: col = col + delta
                            let applied = match stored.get(key).and_then(Value::as_long) {
                                Some(current) => current + d.delta,
                                None => d.full_value(),
                            };
                            stored.insert(key.clone(), Value::Long(applied));
                        }
                        value => {
                            stored.insert(key.clone(), value);
                        }
                    }
                }
                Ok(())
            }
            (RowData::Array(stored), RowData::Array(new), None) => {
                // whole-collection rewrite: delete + reinsert
                *stored = new.clone();
                Ok(())
            }
            _ => Err(StoreError::storage(format!(
                "update shape mismatch for {}",
                update.row.id
            ))),
        }
    }

    fn resolve_create(data: &RowData) -> RowData {
        match data {
            RowData::Map(map) => RowData::Map(
                map.iter()
                    .filter(|(_, v)| !v.is_opaque())
                    .map(|(k, v)| (k.clone(), v.resolved()))
                    .collect(),
            ),
            RowData::Array(values) => RowData::Array(values.clone()),
        }
    }

    fn node_info(tables: &HashMap<RowId, RowData>, id: DocId) -> Option<NodeInfo> {
        let hier = tables.get(&RowId::new(HIER_TABLE, id))?;
        let version = tables.get(&RowId::new(VERSION_TABLE, id));
        let proxy = tables.get(&RowId::new(PROXY_TABLE, id));
        Some(NodeInfo {
            id,
            parent_id: Self::map_value(hier, HIER_PARENT_KEY).as_id(),
            primary_type: Self::map_value(hier, MAIN_PRIMARY_TYPE_KEY)
                .as_str()
                .unwrap_or_default()
                .to_owned(),
            is_property: Self::map_value(hier, HIER_IS_PROPERTY_KEY).is_true(),
            version_series_id: version
                .map(|v| Self::map_value(v, VERSION_VERSIONABLE_KEY))
                .and_then(|v| v.as_id())
                .or_else(|| {
                    proxy
                        .map(|p| Self::map_value(p, PROXY_VERSIONABLE_KEY))
                        .and_then(|v| v.as_id())
                }),
            target_id: proxy
                .map(|p| Self::map_value(p, PROXY_TARGET_KEY))
                .and_then(|v| v.as_id()),
        })
    }
}

impl RowMapper for MemoryMapper {
    fn read(&self, row_ids: &[RowId], _cache_only: bool) -> StoreResult<Vec<RowRead>> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        Ok(row_ids
            .iter()
            .map(|row_id| match tables.get(row_id) {
                Some(data) => RowRead::Found(Row {
                    id: row_id.clone(),
                    data: data.clone(),
                }),
                None => RowRead::Absent(row_id.clone()),
            })
            .collect())
    }

    fn read_simple_row(&self, row_id: &RowId) -> StoreResult<Option<Row>> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        Ok(tables.get(row_id).map(|data| Row {
            id: row_id.clone(),
            data: data.clone(),
        }))
    }

    fn read_collection_array(&self, row_id: &RowId) -> StoreResult<Option<Row>> {
        self.read_simple_row(row_id)
    }

    fn read_selection_rows(
        &self,
        selection: SelectionType,
        selection_id: DocId,
        filter: Option<(&str, &Value)>,
    ) -> StoreResult<Vec<Row>> {
        self.selection_read_count.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        let table = selection.table();
        let sel_key = selection.selection_key();
        let criterion = selection.criterion();
        let rows = tables
            .iter()
            .filter(|(row_id, _)| row_id.table == table)
            .filter(|(_, data)| Self::map_value(data, sel_key).as_id() == Some(selection_id))
            .filter(|(_, data)| match &criterion {
                Some((key, value)) => Self::map_value(data, key) == *value,
                None => true,
            })
            .filter(|(_, data)| match filter {
                Some((key, value)) => Self::map_value(data, key) == *value,
                None => true,
            })
            .map(|(row_id, data)| Row {
                id: row_id.clone(),
                data: data.clone(),
            })
            .collect();
        Ok(rows)
    }

    fn write(&self, batch: &RowBatch) -> StoreResult<()> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock();
        for row in &batch.creates {
            if tables.contains_key(&row.id) {
                return Err(StoreError::concurrent_update(format!(
                    "duplicate key on insert: {}",
                    row.id
                )));
            }
            tables.insert(row.id.clone(), Self::resolve_create(&row.data));
        }
        for update in &batch.updates {
            match tables.get_mut(&update.row.id) {
                Some(stored) => Self::apply_update(stored, update)?,
                None => {
                    return Err(StoreError::concurrent_update(format!(
                        "row vanished under update: {}",
                        update.row.id
                    )))
                }
            }
        }
        for row_id in &batch.deletes {
            tables.remove(row_id);
        }
        Ok(())
    }

    fn copy(
        &self,
        source: &IdWithTypes,
        dest_parent_id: Option<DocId>,
        dest_name: Option<&str>,
        overwrite_row: Option<&Row>,
    ) -> StoreResult<CopyResult> {
        let mut tables = self.tables.lock();
        // a checkin-style copy (no destination parent) snapshots complex
        // properties only
        let subtree = Self::collect_subtree(&tables, source.id, dest_parent_id.is_none());

        let mut id_map: HashMap<DocId, DocId> = HashMap::new();
        let root_new_id = match overwrite_row {
            Some(row) => row.id.id,
            None => DocId::new(),
        };
        id_map.insert(source.id, root_new_id);
        for old_id in subtree.iter().skip(1) {
            id_map.insert(*old_id, DocId::new());
        }

        let mut invalidations = Invalidations::new();
        let mut proxy_ids = Vec::new();
        let mut staged: Vec<(RowId, RowData)> = Vec::new();

        for old_id in &subtree {
            let new_id = id_map[old_id];
            let is_root = *old_id == source.id;
            let hier_row_id = RowId::new(HIER_TABLE, *old_id);
            let hier = tables
                .get(&hier_row_id)
                .ok_or_else(|| StoreError::storage(format!("missing hierarchy row: {old_id}")))?
                .clone();

            let primary_type = Self::map_value(&hier, MAIN_PRIMARY_TYPE_KEY)
                .as_str()
                .unwrap_or_default()
                .to_owned();

            if let (true, Some(overwrite)) = (is_root, overwrite_row) {
                // version restore: update the existing hierarchy row in
                // place, leaving opaque columns alone
                let target_row_id = RowId::new(HIER_TABLE, new_id);
                let mut existing = tables
                    .get(&target_row_id)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::storage(format!("missing overwrite target: {new_id}"))
                    })?;
                if let (RowData::Map(stored), RowData::Map(new)) = (&mut existing, &overwrite.data)
                {
                    for (key, value) in new {
                        if !value.is_opaque() {
                            stored.insert(key.clone(), value.resolved());
                        }
                    }
                }
                staged.push((target_row_id.clone(), existing));
                invalidations.add_modified(target_row_id);
            } else if let RowData::Map(map) = &hier {
                let mut copy = map.clone();
                if is_root {
                    copy.insert(
                        HIER_PARENT_KEY.to_owned(),
                        match dest_parent_id {
                            Some(pid) => Value::Id(pid),
                            None => Value::Null,
                        },
                    );
                    if let Some(name) = dest_name {
                        copy.insert(HIER_NAME_KEY.to_owned(), Value::from(name));
                    }
                } else {
                    let old_parent = Self::map_value(&hier, HIER_PARENT_KEY)
                        .as_id()
                        .and_then(|pid| id_map.get(&pid).copied());
                    copy.insert(
                        HIER_PARENT_KEY.to_owned(),
                        match old_parent {
                            Some(pid) => Value::Id(pid),
                            None => Value::Null,
                        },
                    );
                }
                staged.push((RowId::new(HIER_TABLE, new_id), RowData::Map(copy)));
            }

            // data fragments follow the node's type
            for fragment in self.model.type_fragments(&primary_type)? {
                if fragment == HIER_TABLE {
                    continue;
                }
                if let Some(data) = tables.get(&RowId::new(fragment.as_str(), *old_id)) {
                    let target = RowId::new(fragment.as_str(), new_id);
                    if is_root && overwrite_row.is_some() {
                        invalidations.add_modified(target.clone());
                    }
                    staged.push((target, data.clone()));
                }
            }

            if primary_type == PROXY_TYPE {
                if let Some(data) = tables.get(&RowId::new(PROXY_TABLE, *old_id)) {
                    staged.push((RowId::new(PROXY_TABLE, new_id), data.clone()));
                    proxy_ids.push(new_id);
                }
            }
            // version rows are never copied: a copy of a version is a
            // plain document
        }

        for (row_id, data) in staged {
            tables.insert(row_id, data);
        }
        if let Some(parent_id) = dest_parent_id {
            invalidations.add_modified_parent(parent_id);
        }

        Ok(CopyResult {
            copy_id: root_new_id,
            invalidations,
            proxy_ids,
        })
    }

    fn remove(&self, root_info: &NodeInfo) -> StoreResult<Vec<NodeInfo>> {
        let mut tables = self.tables.lock();
        let subtree = Self::collect_subtree(&tables, root_info.id, false);
        let mut infos = Vec::with_capacity(subtree.len());
        for id in &subtree {
            if let Some(info) = Self::node_info(&tables, *id) {
                infos.push(info);
            }
        }
        let table_names: Vec<String> =
            self.model.fragment_names().map(str::to_owned).collect();
        for id in &subtree {
            for table in &table_names {
                tables.remove(&RowId::new(table.as_str(), *id));
            }
        }
        Ok(infos)
    }

    fn get_lock(&self, id: DocId) -> StoreResult<Option<Lock>> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        Ok(tables.get(&RowId::new(LOCK_TABLE, id)).map(|data| Lock {
            owner: Self::map_value(data, LOCK_OWNER_KEY)
                .as_str()
                .unwrap_or_default()
                .to_owned(),
            created: Self::map_value(data, LOCK_CREATED_KEY)
                .as_timestamp()
                .unwrap_or_default(),
            failed: false,
        }))
    }

    fn set_lock(&self, id: DocId, lock: &Lock) -> StoreResult<Option<Lock>> {
        let mut tables = self.tables.lock();
        let row_id = RowId::new(LOCK_TABLE, id);
        if let Some(existing) = tables.get(&row_id) {
            return Ok(Some(Lock {
                owner: Self::map_value(existing, LOCK_OWNER_KEY)
                    .as_str()
                    .unwrap_or_default()
                    .to_owned(),
                created: Self::map_value(existing, LOCK_CREATED_KEY)
                    .as_timestamp()
                    .unwrap_or_default(),
                failed: false,
            }));
        }
        let mut data = std::collections::BTreeMap::new();
        data.insert(LOCK_OWNER_KEY.to_owned(), Value::from(lock.owner.clone()));
        data.insert(LOCK_CREATED_KEY.to_owned(), Value::Timestamp(lock.created));
        tables.insert(row_id, RowData::Map(data));
        Ok(None)
    }

    fn remove_lock(&self, id: DocId) -> StoreResult<Option<Lock>> {
        let old = self.get_lock(id)?;
        self.tables.lock().remove(&RowId::new(LOCK_TABLE, id));
        Ok(old)
    }

    fn begin(&self) -> StoreResult<()> {
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        Ok(())
    }

    fn send_invalidations(&self, _invalidations: &Invalidations) -> StoreResult<()> {
        Ok(())
    }

    fn receive_invalidations(&self) -> StoreResult<Option<Invalidations>> {
        Ok(None)
    }

    fn clear_cache(&self) {}

    fn cache_size(&self) -> usize {
        0
    }
}

impl std::fmt::Debug for MemoryMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMapper")
            .field("rows", &self.row_count())
            .field("reads", &self.read_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_model::{ModelBuilder, PropertyKind};

    fn model() -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .simple_fragment("dublincore", &[("title", PropertyKind::String)])
                .unwrap()
                .doc_type("file", &["dublincore"], &[])
                .unwrap()
                .doc_type("folder", &["dublincore"], &[])
                .unwrap()
                .build(),
        )
    }

    fn hier_row(id: DocId, parent: Option<DocId>, name: &str, doc_type: &str) -> Row {
        let mut row = Row::new(HIER_TABLE, id);
        row.put(
            HIER_PARENT_KEY,
            parent.map(Value::Id).unwrap_or(Value::Null),
        );
        row.put(HIER_NAME_KEY, Value::from(name));
        row.put(HIER_IS_PROPERTY_KEY, Value::Bool(false));
        row.put(MAIN_PRIMARY_TYPE_KEY, Value::from(doc_type));
        row
    }

    fn create(mapper: &MemoryMapper, rows: Vec<Row>) {
        let batch = RowBatch {
            creates: rows,
            ..RowBatch::default()
        };
        mapper.write(&batch).unwrap();
    }

    #[test]
    fn read_found_and_absent() {
        let mapper = MemoryMapper::new(model());
        let id = DocId::new();
        create(&mapper, vec![hier_row(id, None, "root", "folder")]);

        let missing = RowId::new(HIER_TABLE, DocId::new());
        let reads = mapper
            .read(&[RowId::new(HIER_TABLE, id), missing.clone()], false)
            .unwrap();
        assert_eq!(reads.len(), 2);
        assert!(reads.iter().any(|r| matches!(r, RowRead::Found(_))));
        assert!(reads
            .iter()
            .any(|r| matches!(r, RowRead::Absent(row_id) if *row_id == missing)));
    }

    #[test]
    fn duplicate_create_is_concurrent_update() {
        let mapper = MemoryMapper::new(model());
        let id = DocId::new();
        create(&mapper, vec![hier_row(id, None, "a", "file")]);
        let batch = RowBatch {
            creates: vec![hier_row(id, None, "a", "file")],
            ..RowBatch::default()
        };
        let err = mapper.write(&batch).unwrap_err();
        assert!(err.is_concurrency());
    }

    #[test]
    fn delta_update_applies_increment() {
        let mapper = MemoryMapper::new(model());
        let id = DocId::new();
        let mut row = Row::new("dublincore", id);
        row.put("count", Value::Long(10));
        create(&mapper, vec![row]);

        let mut update_row = Row::new("dublincore", id);
        update_row.put("count", Value::Delta(crate::value::DeltaLong::new(10, 5)));
        let batch = RowBatch {
            updates: vec![RowUpdate::for_keys(update_row, vec!["count".to_owned()])],
            ..RowBatch::default()
        };
        mapper.write(&batch).unwrap();

        let stored = mapper
            .read_simple_row(&RowId::new("dublincore", id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("count"), Some(&Value::Long(15)));
    }

    #[test]
    fn selection_reads_children() {
        let mapper = MemoryMapper::new(model());
        let parent = DocId::new();
        let a = DocId::new();
        let b = DocId::new();
        create(
            &mapper,
            vec![
                hier_row(parent, None, "root", "folder"),
                hier_row(a, Some(parent), "a", "file"),
                hier_row(b, Some(parent), "b", "file"),
            ],
        );
        let rows = mapper
            .read_selection_rows(SelectionType::ChildrenRegular, parent, None)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(mapper.selection_read_count(), 1);
    }

    #[test]
    fn copy_clones_subtree_under_new_ids() {
        let mapper = MemoryMapper::new(model());
        let root = DocId::new();
        let child = DocId::new();
        create(
            &mapper,
            vec![
                hier_row(root, None, "root", "folder"),
                hier_row(child, Some(root), "kid", "file"),
            ],
        );
        let dest = DocId::new();
        create(&mapper, vec![hier_row(dest, None, "dest", "folder")]);

        let result = mapper
            .copy(&IdWithTypes::new(root, "folder"), Some(dest), Some("copy"), None)
            .unwrap();
        assert_ne!(result.copy_id, root);
        // original still present
        assert!(mapper.has_row(&RowId::new(HIER_TABLE, root)));
        // the copy's child hangs under the new root
        let copied_children = mapper
            .read_selection_rows(SelectionType::ChildrenRegular, result.copy_id, None)
            .unwrap();
        assert_eq!(copied_children.len(), 1);
        assert!(result
            .invalidations
            .modified
            .iter()
            .any(|r| r.table == crate::invalidations::PARENT_INVAL));
    }

    #[test]
    fn remove_deletes_subtree_and_reports_nodes() {
        let mapper = MemoryMapper::new(model());
        let root = DocId::new();
        let child = DocId::new();
        let grandchild = DocId::new();
        create(
            &mapper,
            vec![
                hier_row(root, None, "root", "folder"),
                hier_row(child, Some(root), "kid", "folder"),
                hier_row(grandchild, Some(child), "leaf", "file"),
            ],
        );
        let info = NodeInfo {
            id: root,
            parent_id: None,
            primary_type: "folder".to_owned(),
            is_property: false,
            version_series_id: None,
            target_id: None,
        };
        let removed = mapper.remove(&info).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(mapper.row_count(), 0);
    }

    #[test]
    fn lock_lifecycle() {
        let mapper = MemoryMapper::new(model());
        let id = DocId::new();
        assert!(mapper.get_lock(id).unwrap().is_none());

        let lock = Lock::new("alice", 1000);
        assert!(mapper.set_lock(id, &lock).unwrap().is_none());
        // second set returns the existing lock
        let existing = mapper.set_lock(id, &Lock::new("bob", 2000)).unwrap();
        assert_eq!(existing.unwrap().owner, "alice");

        let removed = mapper.remove_lock(id).unwrap().unwrap();
        assert_eq!(removed.owner, "alice");
        assert!(mapper.get_lock(id).unwrap().is_none());
    }
}
