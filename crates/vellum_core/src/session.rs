//! The session facade over the persistence context.

use crate::config::StoreConfig;
use crate::context::PersistenceContext;
use crate::fragment::State;
use crate::node::Node;
use std::collections::HashSet;
use std::sync::Arc;
use vellum_mapper::{
    IdWithTypes, Row, RowMapper, StoreError, StoreResult, Value,
};
use vellum_model::{
    DocId, Model, HIER_IS_PROPERTY_KEY, HIER_NAME_KEY, HIER_PARENT_KEY, HIER_POS_KEY, HIER_TABLE,
    MAIN_BASE_VERSION_KEY, MAIN_CHECKED_IN_KEY, MAIN_IS_VERSION_KEY, MAIN_PRIMARY_TYPE_KEY,
    PROXY_TABLE, PROXY_TARGET_KEY, PROXY_TYPE, PROXY_VERSIONABLE_KEY,
};

/// A single-threaded unit of work over one repository.
///
/// The session owns a [`PersistenceContext`] and receives its
/// collaborators explicitly at construction: the shared [`Model`] and a
/// [`RowMapper`] (usually a caching decorator).
///
/// Within one session, reads observe the session's own unflushed
/// writes. Writes become visible to other sessions only after
/// [`Session::commit`] propagates invalidations; each session applies
/// what it received at its next [`Session::begin`]. This is
/// read-your-own-writes plus eventual cross-session consistency, not
/// linearizability.
pub struct Session {
    model: Arc<Model>,
    mapper: Arc<dyn RowMapper>,
    context: PersistenceContext,
    fulltext_dirty_strings: HashSet<DocId>,
    fulltext_dirty_binaries: HashSet<DocId>,
}

impl Session {
    /// Creates a session over a model and mapper.
    #[must_use]
    pub fn new(model: Arc<Model>, mapper: Arc<dyn RowMapper>, config: &StoreConfig) -> Self {
        let context = PersistenceContext::new(Arc::clone(&model), Arc::clone(&mapper), config);
        Self {
            model,
            mapper,
            context,
            fulltext_dirty_strings: HashSet::new(),
            fulltext_dirty_binaries: HashSet::new(),
        }
    }

    /// The repository model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The persistence context, for lower-level access.
    #[must_use]
    pub fn context(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    /*
     * ----- Transaction boundaries -----
     */

    /// Starts a transaction and applies the invalidations other
    /// sessions addressed to us since our last one.
    pub fn begin(&mut self) -> StoreResult<()> {
        self.context.check_thread()?;
        self.mapper.begin()?;
        self.context.process_received_invalidations()
    }

    /// Flushes all pending changes to the mapper as one batch.
    ///
    /// Also records which documents became dirty for fulltext; the
    /// external indexer collects them with
    /// [`Session::take_fulltext_dirty`].
    pub fn save(&mut self) -> StoreResult<()> {
        self.context.check_thread()?;
        self.context.find_dirty_documents(
            &mut self.fulltext_dirty_strings,
            &mut self.fulltext_dirty_binaries,
        )?;
        let batch = self.context.get_save_batch()?;
        if !batch.is_empty() {
            self.mapper.write(&batch)?;
        }
        Ok(())
    }

    /// Saves, sends invalidations and commits.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.save()?;
        self.context.send_invalidations_to_others()?;
        self.mapper.commit()
    }

    /// Rolls back the transaction and drops every local cache; pending
    /// changes are discarded.
    pub fn rollback(&mut self) -> StoreResult<()> {
        self.context.check_thread()?;
        self.mapper.rollback()?;
        self.context.clear_caches();
        Ok(())
    }

    /// The documents made fulltext-dirty since the last call: first the
    /// string-dirty set, then the binary-dirty set.
    pub fn take_fulltext_dirty(&mut self) -> (HashSet<DocId>, HashSet<DocId>) {
        (
            std::mem::take(&mut self.fulltext_dirty_strings),
            std::mem::take(&mut self.fulltext_dirty_binaries),
        )
    }

    /*
     * ----- Node creation and lookup -----
     */

    /// Creates the repository root.
    pub fn create_root(&mut self, primary_type: &str) -> StoreResult<Node> {
        self.create_node_inner(None, "", primary_type, false, false)
    }

    /// Creates a document node under a parent.
    pub fn create_node(
        &mut self,
        parent: &Node,
        name: &str,
        primary_type: &str,
    ) -> StoreResult<Node> {
        self.create_node_inner(Some(parent.id()), name, primary_type, false, true)
    }

    /// Creates a complex-property node under a parent.
    pub fn create_complex_property(
        &mut self,
        parent: &Node,
        name: &str,
        primary_type: &str,
    ) -> StoreResult<Node> {
        self.create_node_inner(Some(parent.id()), name, primary_type, true, true)
    }

    fn create_node_inner(
        &mut self,
        parent_id: Option<DocId>,
        name: &str,
        primary_type: &str,
        complex: bool,
        check_name: bool,
    ) -> StoreResult<Node> {
        self.context.check_thread()?;
        if check_name {
            validate_name(name)?;
        }
        self.model.doc_type(primary_type)?;
        let pos = match parent_id {
            Some(parent_id) => {
                self.context.check_free_name(parent_id, name, complex)?;
                self.context.next_pos(parent_id, complex)?
            }
            None => None,
        };
        let id = self.context.generate_new_id(None);
        let mut row = Row::new(HIER_TABLE, id);
        row.put(
            HIER_PARENT_KEY,
            parent_id.map(Value::Id).unwrap_or(Value::Null),
        );
        row.put(HIER_NAME_KEY, Value::from(name));
        row.put(
            HIER_POS_KEY,
            pos.map(Value::Long).unwrap_or(Value::Null),
        );
        row.put(HIER_IS_PROPERTY_KEY, Value::Bool(complex));
        row.put(MAIN_PRIMARY_TYPE_KEY, Value::from(primary_type));
        let hier = self.context.create_hierarchy_fragment(row)?;
        Ok(Node::new(hier))
    }

    /// Creates a proxy node pointing at a version.
    pub fn create_proxy(
        &mut self,
        parent: &Node,
        name: &str,
        series_id: DocId,
        target_id: DocId,
    ) -> StoreResult<Node> {
        let node = self.create_node_inner(Some(parent.id()), name, PROXY_TYPE, false, true)?;
        let mut row = Row::new(PROXY_TABLE, node.id());
        row.put(PROXY_TARGET_KEY, Value::Id(target_id));
        row.put(PROXY_VERSIONABLE_KEY, Value::Id(series_id));
        let fragment = self.context.create_simple_fragment(row)?;
        self.context.created_proxy_fragment(&fragment)?;
        Ok(node)
    }

    /// Fetches a node by id.
    ///
    /// Returns `None` for unknown ids and for nodes whose ancestors
    /// were deleted: removal does not recursively evict descendants, so
    /// orphans are detected here, at lookup time.
    pub fn node_by_id(&mut self, id: DocId) -> StoreResult<Option<Node>> {
        self.context.check_thread()?;
        if self.context.is_deleted(id)? {
            return Ok(None);
        }
        let Some(hier) = self.context.get_hier(id, false)? else {
            return Ok(None);
        };
        if hier.read().state() == State::Absent {
            return Ok(None);
        }
        Ok(Some(Node::new(hier)))
    }

    /// Fetches one child by name.
    pub fn child_by_name(
        &mut self,
        parent: &Node,
        name: &str,
        complex: bool,
    ) -> StoreResult<Option<Node>> {
        self.context.check_thread()?;
        let fragment = self.context.get_child_by_name(parent.id(), name, complex)?;
        Ok(fragment.map(Node::new))
    }

    /// Fetches the children of a node, in position order when the
    /// parent is orderable.
    pub fn children(&mut self, parent: &Node, complex: bool) -> StoreResult<Vec<Node>> {
        self.context.check_thread()?;
        let fragments = self.context.get_children(parent.id(), None, complex)?;
        Ok(fragments.into_iter().map(Node::new).collect())
    }

    /// The path of a node.
    pub fn path(&mut self, node: &Node) -> StoreResult<String> {
        self.context.check_thread()?;
        self.context.path_of(node.hier_fragment())
    }

    /*
     * ----- Properties -----
     */

    /// Reads a simple property.
    pub fn simple_value(&mut self, node: &Node, name: &str) -> StoreResult<Value> {
        self.context.check_thread()?;
        let property = node.simple_property(&self.model, name)?;
        let fragment = self
            .context
            .get(&property.row_id, true)?
            .ok_or_else(|| StoreError::storage(format!("no fragment {}", property.row_id)))?;
        self.context.get_value(&fragment, &property.key)
    }

    /// Writes a simple property.
    pub fn set_simple(&mut self, node: &Node, name: &str, value: Value) -> StoreResult<()> {
        self.context.check_thread()?;
        let property = node.simple_property(&self.model, name)?;
        if property.readonly {
            return Err(StoreError::invalid_operation(format!(
                "property is read-only: {name}"
            )));
        }
        let fragment = self
            .context
            .get(&property.row_id, true)?
            .ok_or_else(|| StoreError::storage(format!("no fragment {}", property.row_id)))?;
        self.context.put_value(&fragment, &property.key, value)
    }

    /// Reads a collection property.
    pub fn collection_value(&mut self, node: &Node, name: &str) -> StoreResult<Vec<Value>> {
        self.context.check_thread()?;
        let property = node.collection_property(&self.model, name)?;
        let fragment = self
            .context
            .get(&property.row_id, true)?
            .ok_or_else(|| StoreError::storage(format!("no fragment {}", property.row_id)))?;
        self.context.get_array(&fragment)
    }

    /// Replaces a collection property; the whole array is rewritten at
    /// flush.
    pub fn set_collection(
        &mut self,
        node: &Node,
        name: &str,
        values: Vec<Value>,
    ) -> StoreResult<()> {
        self.context.check_thread()?;
        let property = node.collection_property(&self.model, name)?;
        if property.readonly {
            return Err(StoreError::invalid_operation(format!(
                "property is read-only: {name}"
            )));
        }
        let fragment = self
            .context
            .get(&property.row_id, true)?
            .ok_or_else(|| StoreError::storage(format!("no fragment {}", property.row_id)))?;
        self.context.set_array(&fragment, values)
    }

    /*
     * ----- Hierarchy operations -----
     */

    /// Moves a node to a new parent with a new name.
    ///
    /// Flushes first: an actual move relies on the database holding the
    /// current tree.
    pub fn move_node(&mut self, source: &Node, parent: &Node, name: &str) -> StoreResult<()> {
        validate_name(name)?;
        self.save()?;
        self.context.move_node(source, parent.id(), name)
    }

    /// Copies a node (deep) under a new parent; returns the copy.
    pub fn copy_node(&mut self, source: &Node, parent: &Node, name: &str) -> StoreResult<Node> {
        validate_name(name)?;
        self.save()?;
        let new_id = self.context.copy_node(source, parent.id(), name)?;
        self.node_by_id(new_id)?
            .ok_or_else(|| StoreError::storage(format!("copy not found: {new_id}")))
    }

    /// Removes a node and its descendants.
    pub fn remove_node(&mut self, node: &Node) -> StoreResult<()> {
        self.save()?;
        self.context.remove_node(node.hier_fragment())
    }

    /// Removes a complex-property node and its children.
    pub fn remove_property_node(&mut self, node: &Node) -> StoreResult<()> {
        self.context.check_thread()?;
        self.context.remove_property_node(node.hier_fragment())
    }

    /// Orders `source` before `dest` among the children of `parent`;
    /// `dest == None` moves it to the end. A no-op on unorderable
    /// parents.
    pub fn order_before(
        &mut self,
        parent: &Node,
        source_id: DocId,
        dest_id: Option<DocId>,
    ) -> StoreResult<()> {
        self.context.check_thread()?;
        self.context.order_before(parent.id(), source_id, dest_id)
    }

    /*
     * ----- Versioning -----
     */

    /// Checks in a node, creating a version; returns the version node.
    pub fn check_in(
        &mut self,
        node: &Node,
        label: Option<&str>,
        description: Option<&str>,
    ) -> StoreResult<Node> {
        self.save()?;
        let version_id = self.context.check_in(node, label, description)?;
        let hier = self
            .context
            .get_hier(version_id, false)?
            .ok_or_else(|| StoreError::storage(format!("version not found: {version_id}")))?;
        Ok(Node::new(hier))
    }

    /// Checks out a node.
    pub fn check_out(&mut self, node: &Node) -> StoreResult<()> {
        self.context.check_thread()?;
        self.context.check_out(node)
    }

    /// Restores a node to one of its versions. The restored node is
    /// checked in.
    pub fn restore_version(&mut self, node: &Node, version: &Node) -> StoreResult<()> {
        self.context.check_thread()?;
        // clear complex properties of the live node first
        let children = self.context.get_children(node.id(), None, true)?;
        for child in children {
            self.context.remove_property_node(&child)?;
        }
        self.save()?; // flush the deletes

        // overwrite the live hierarchy row with the version's values,
        // preserving identity and placement
        let mut overwrite = Row::new(HIER_TABLE, node.id());
        let keys: Vec<String> = self
            .model
            .fragment_keys(HIER_TABLE)?
            .keys()
            .cloned()
            .collect();
        {
            let version_hier = version.hier_fragment().read();
            for key in keys {
                if matches!(
                    key.as_str(),
                    HIER_PARENT_KEY
                        | HIER_NAME_KEY
                        | HIER_POS_KEY
                        | HIER_IS_PROPERTY_KEY
                        | MAIN_PRIMARY_TYPE_KEY
                        | MAIN_CHECKED_IN_KEY
                        | MAIN_BASE_VERSION_KEY
                        | MAIN_IS_VERSION_KEY
                ) {
                    continue;
                }
                overwrite.put(key.as_str(), version_hier.get(&key));
            }
        }
        overwrite.put(MAIN_CHECKED_IN_KEY, Value::Bool(true));
        overwrite.put(MAIN_BASE_VERSION_KEY, Value::Id(version.id()));
        overwrite.put(MAIN_IS_VERSION_KEY, Value::Null);

        let result = self.mapper.copy(
            &IdWithTypes::new(version.id(), version.primary_type()),
            node.parent_id(),
            None,
            Some(&overwrite),
        )?;
        self.context.mark_invalidated(&result.invalidations);
        Ok(())
    }

    /// The version ids of a series, in creation order.
    pub fn version_ids(&mut self, series_id: DocId) -> StoreResult<Vec<DocId>> {
        self.context.check_thread()?;
        self.context.get_version_ids(series_id)
    }
}

fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(StoreError::invalid_name(name));
    }
    Ok(())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_mapper::MemoryMapper;
    use vellum_model::{ModelBuilder, PropertyKind, ORDERABLE_FACET};

    fn model() -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .simple_fragment(
                    "dublincore",
                    &[
                        ("title", PropertyKind::String),
                        ("counter", PropertyKind::Long),
                    ],
                )
                .unwrap()
                .collection_fragment("contributors", PropertyKind::String)
                .unwrap()
                .doc_type("root", &[], &[])
                .unwrap()
                .doc_type("file", &["dublincore", "contributors"], &[])
                .unwrap()
                .doc_type("folder", &["dublincore"], &[ORDERABLE_FACET])
                .unwrap()
                .build(),
        )
    }

    fn session() -> Session {
        let model = model();
        let mapper: Arc<dyn RowMapper> = Arc::new(MemoryMapper::new(Arc::clone(&model)));
        Session::new(model, mapper, &StoreConfig::default())
    }

    #[test]
    fn create_and_refetch_node() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let doc = session.create_node(&root, "doc", "file").unwrap();
        session
            .set_simple(&doc, "dublincore:title", Value::from("hello"))
            .unwrap();
        session.save().unwrap();

        let fetched = session.node_by_id(doc.id()).unwrap().unwrap();
        assert_eq!(fetched.name(), "doc");
        assert_eq!(
            session.simple_value(&fetched, "dublincore:title").unwrap(),
            Value::from("hello")
        );
    }

    #[test]
    fn uncommitted_reads_see_own_writes() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let doc = session.create_node(&root, "doc", "file").unwrap();
        session
            .set_simple(&doc, "dublincore:title", Value::from("pending"))
            .unwrap();
        // no save yet
        assert_eq!(
            session.simple_value(&doc, "dublincore:title").unwrap(),
            Value::from("pending")
        );
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        assert!(matches!(
            session.create_node(&root, "a/b", "file"),
            Err(StoreError::InvalidName { .. })
        ));
        assert!(matches!(
            session.create_node(&root, "", "file"),
            Err(StoreError::InvalidName { .. })
        ));
    }

    #[test]
    fn duplicate_child_name_is_rejected() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        session.create_node(&root, "doc", "file").unwrap();
        assert!(matches!(
            session.create_node(&root, "doc", "file"),
            Err(StoreError::DocumentExists { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        assert!(session.create_node(&root, "doc", "nosuchtype").is_err());
    }

    #[test]
    fn collection_roundtrip() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let doc = session.create_node(&root, "doc", "file").unwrap();
        let values = vec![Value::from("alice"), Value::from("bob")];
        session
            .set_collection(&doc, "contributors", values.clone())
            .unwrap();
        session.save().unwrap();
        assert_eq!(session.collection_value(&doc, "contributors").unwrap(), values);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let doc = session.create_node(&root, "doc", "file").unwrap();
        session
            .set_simple(&doc, "dublincore:title", Value::from("x"))
            .unwrap();

        let batch = session.context().get_save_batch().unwrap();
        assert!(!batch.is_empty());
        let second = session.context().get_save_batch().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn fulltext_dirty_documents_are_reported() {
        let model = Arc::new(
            ModelBuilder::new()
                .simple_fragment("dublincore", &[("title", PropertyKind::String)])
                .unwrap()
                .doc_type("root", &[], &[])
                .unwrap()
                .doc_type("file", &["dublincore"], &[])
                .unwrap()
                .fulltext_index("dublincore", "title")
                .unwrap()
                .build(),
        );
        let mapper: Arc<dyn RowMapper> = Arc::new(MemoryMapper::new(Arc::clone(&model)));
        let mut session = Session::new(model, mapper, &StoreConfig::default());

        let root = session.create_root("root").unwrap();
        let doc = session.create_node(&root, "doc", "file").unwrap();
        session
            .set_simple(&doc, "dublincore:title", Value::from("indexed"))
            .unwrap();
        session.save().unwrap();

        let (strings, binaries) = session.take_fulltext_dirty();
        assert!(strings.contains(&doc.id()));
        assert!(binaries.is_empty());
        // drained
        let (strings, _) = session.take_fulltext_dirty();
        assert!(strings.is_empty());
    }

    #[test]
    fn removed_node_and_descendants_disappear() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let folder = session.create_node(&root, "folder", "folder").unwrap();
        let child = session.create_node(&folder, "child", "file").unwrap();
        session.save().unwrap();

        session.remove_node(&folder).unwrap();
        assert!(session.node_by_id(folder.id()).unwrap().is_none());
        // the pristine descendant is detected as orphaned at lookup
        assert!(session.node_by_id(child.id()).unwrap().is_none());
    }

    #[test]
    fn move_under_self_is_rejected() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let a = session.create_node(&root, "a", "folder").unwrap();
        let b = session.create_node(&a, "b", "folder").unwrap();
        let _c = session.create_node(&b, "c", "file").unwrap();
        session.save().unwrap();

        let result = session.move_node(&a, &b, "x");
        assert!(matches!(result, Err(StoreError::StructuralCycle { .. })));
    }

    #[test]
    fn paths_walk_up_the_hierarchy() {
        let mut session = session();
        let root = session.create_root("root").unwrap();
        let folder = session.create_node(&root, "folder", "folder").unwrap();
        let doc = session.create_node(&folder, "doc", "file").unwrap();

        assert_eq!(session.path(&root).unwrap(), "/");
        assert_eq!(session.path(&doc).unwrap(), "/folder/doc");
    }
}
