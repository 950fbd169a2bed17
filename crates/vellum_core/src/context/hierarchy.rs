//! Hierarchy operations: children, paths, ordering, move/copy/remove.

use super::{PersistenceContext, SelKind};
use crate::fragment::{FragmentRef, State};
use crate::node::Node;
use crate::selection::{Selection, SelectionLookup};
use std::collections::VecDeque;
use std::sync::Arc;
use vellum_mapper::{IdWithTypes, NodeInfo, RowId, StoreError, StoreResult, Value};
use vellum_model::{
    DocId, HIER_IS_PROPERTY_KEY, HIER_NAME_KEY, HIER_PARENT_KEY, HIER_POS_KEY, HIER_TABLE,
    MAIN_IS_VERSION_KEY, MAIN_PRIMARY_TYPE_KEY, ORDERABLE_FACET, PROXY_TABLE, PROXY_TARGET_KEY,
    PROXY_TYPE, PROXY_VERSIONABLE_KEY, VERSION_TABLE, VERSION_VERSIONABLE_KEY,
};

impl PersistenceContext {
    /// Whether a hierarchy fragment is a complex property.
    pub(crate) fn complex_prop(fragment: &FragmentRef) -> bool {
        fragment.read().is_true(HIER_IS_PROPERTY_KEY)
    }

    /// Gets a hierarchy fragment by node id.
    pub fn get_hier(
        &mut self,
        id: DocId,
        allow_absent: bool,
    ) -> StoreResult<Option<FragmentRef>> {
        self.get(&RowId::new(HIER_TABLE, id), allow_absent)
    }

    /*
     * ----- Selection-backed reads -----
     */

    /// All fragments of a selection, optionally filtered by one column
    /// value. Queries the mapper once when the member set is not yet
    /// complete; afterwards the cache answers until invalidated.
    pub(crate) fn selection_fragments(
        &mut self,
        kind: SelKind,
        selection_id: DocId,
        filter: Option<(&str, &Value)>,
    ) -> StoreResult<Vec<FragmentRef>> {
        let sel_type = self.sel_mut(kind)?.selection_type();
        let cached = self
            .sel_mut(kind)?
            .get(selection_id)
            .and_then(Selection::complete_ids);
        let ids = match cached {
            Some(ids) => ids,
            None => {
                let mapper = Arc::clone(&self.mapper);
                let rows = mapper.read_selection_rows(sel_type, selection_id, None)?;
                let fragments = self.fragments_from_fetched_rows(rows, false)?;
                let fetched: Vec<DocId> = fragments.iter().map(|f| f.read().id()).collect();
                self.sel_mut(kind)?
                    .with_mut(selection_id, |sel| sel.add_existing_complete(fetched));
                // redo from the cache: the set now also carries
                // newly-created members
                self.sel_mut(kind)?
                    .get(selection_id)
                    .and_then(Selection::complete_ids)
                    .unwrap_or_default()
            }
        };

        let table = sel_type.table();
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(fragment) = self.get(&RowId::new(table, id), false)? else {
                continue;
            };
            let keep = {
                let guard = fragment.read();
                !matches!(
                    guard.state(),
                    State::Deleted | State::Detached | State::Absent
                ) && filter.map_or(true, |(key, value)| guard.get(key) == *value)
            };
            if keep {
                result.push(fragment);
            }
        }
        Ok(result)
    }

    /// Looks one member up by a column value, from cache information
    /// only. `Unknown` means the caller must ask the mapper.
    pub(crate) fn selection_lookup_by_value(
        &mut self,
        kind: SelKind,
        selection_id: DocId,
        key: &str,
        value: &Value,
    ) -> StoreResult<SelectionLookup> {
        let sel_type = self.sel_mut(kind)?.selection_type();
        let Some(snapshot) = self.sel_mut(kind)?.get(selection_id).cloned() else {
            return Ok(SelectionLookup::Unknown);
        };
        let table = sel_type.table();
        for id in snapshot.candidate_ids() {
            let Some(fragment) = self.get(&RowId::new(table, id), false)? else {
                continue;
            };
            let matches = {
                let guard = fragment.read();
                !matches!(
                    guard.state(),
                    State::Deleted | State::Detached | State::Absent
                ) && guard.get(key) == *value
            };
            if matches {
                return Ok(SelectionLookup::Found(id));
            }
        }
        if snapshot.is_complete() {
            Ok(SelectionLookup::Absent)
        } else {
            Ok(SelectionLookup::Unknown)
        }
    }

    /// Hierarchy fragments of the children of `parent_id`, optionally
    /// restricted to one name. Orderable parents get their children
    /// sorted by position (nulls last, ties broken by id).
    pub fn get_children(
        &mut self,
        parent_id: DocId,
        name: Option<&str>,
        complex: bool,
    ) -> StoreResult<Vec<FragmentRef>> {
        let kind = if complex {
            SelKind::HierComplex
        } else {
            SelKind::HierNonComplex
        };
        let filter_value = name.map(Value::from);
        let mut fragments = self.selection_fragments(
            kind,
            parent_id,
            filter_value.as_ref().map(|v| (HIER_NAME_KEY, v)),
        )?;
        if self.is_orderable(parent_id, complex)? {
            fragments.sort_by_key(|fragment| {
                let guard = fragment.read();
                let pos = guard.get_long(HIER_POS_KEY);
                (pos.is_none(), pos, guard.id())
            });
        }
        Ok(fragments)
    }

    /// Finds one child of `parent_id` by name.
    pub fn get_child_by_name(
        &mut self,
        parent_id: DocId,
        name: &str,
        complex: bool,
    ) -> StoreResult<Option<FragmentRef>> {
        let kind = if complex {
            SelKind::HierComplex
        } else {
            SelKind::HierNonComplex
        };
        let value = Value::from(name);
        match self.selection_lookup_by_value(kind, parent_id, HIER_NAME_KEY, &value)? {
            SelectionLookup::Found(id) => self.get_hier(id, false),
            SelectionLookup::Absent => Ok(None),
            SelectionLookup::Unknown => {
                // single filtered read, without paying for the whole
                // selection
                let sel_type = self.sel_mut(kind)?.selection_type();
                let mapper = Arc::clone(&self.mapper);
                let rows =
                    mapper.read_selection_rows(sel_type, parent_id, Some((HIER_NAME_KEY, &value)))?;
                let mut fragments = self.fragments_from_fetched_rows(rows, false)?;
                Ok(fragments.pop())
            }
        }
    }

    /*
     * ----- Ordering -----
     */

    /// Whether children of `parent_id` are explicitly ordered: complex
    /// properties always are, documents only when their type carries
    /// the orderable facet.
    pub fn is_orderable(&mut self, parent_id: DocId, complex: bool) -> StoreResult<bool> {
        if complex {
            return Ok(true);
        }
        let Some(parent) = self.get_hier(parent_id, true)? else {
            return Ok(false);
        };
        let type_name = parent.read().get_string(MAIN_PRIMARY_TYPE_KEY);
        Ok(match type_name {
            Some(type_name) => self.model.has_facet(&type_name, ORDERABLE_FACET),
            None => false,
        })
    }

    /// The position for a new child of `nodeId`, `None` when the parent
    /// is not orderable.
    pub fn next_pos(&mut self, parent_id: DocId, complex: bool) -> StoreResult<Option<i64>> {
        if !self.is_orderable(parent_id, complex)? {
            return Ok(None);
        }
        let mut max = -1;
        for fragment in self.get_children(parent_id, None, complex)? {
            if let Some(pos) = fragment.read().get_long(HIER_POS_KEY) {
                max = max.max(pos);
            }
        }
        Ok(Some(max + 1))
    }

    /// Orders a child before another, renumbering the sibling set so it
    /// stays a dense `0..n` sequence. `dest_id == None` moves the
    /// source to the end. On an unorderable parent this is a no-op.
    ///
    /// Assumes the number of children is small enough to renumber
    /// in memory.
    pub fn order_before(
        &mut self,
        parent_id: DocId,
        source_id: DocId,
        dest_id: Option<DocId>,
    ) -> StoreResult<()> {
        let complex = false;
        if !self.is_orderable(parent_id, complex)? {
            return Ok(());
        }
        if Some(source_id) == dest_id {
            return Ok(());
        }
        let fragments = self.get_children(parent_id, None, complex)?;
        if !fragments.iter().any(|f| f.read().id() == source_id) {
            return Err(StoreError::invalid_operation(format!(
                "{source_id} is not a child of {parent_id}"
            )));
        }

        let mut i: i64 = 0;
        let mut source: Option<FragmentRef> = None;
        let mut dest_pos: Option<i64> = None;
        for fragment in &fragments {
            let id = fragment.read().id();
            if Some(id) == dest_id {
                dest_pos = Some(i);
                i += 1;
                if let Some(src) = &source {
                    self.put_value(src, HIER_POS_KEY, Value::Long(i - 1))?;
                }
            }
            let set_pos = if id == source_id {
                i -= 1;
                source = Some(Arc::clone(fragment));
                dest_pos
            } else {
                Some(i)
            };
            if let Some(pos) = set_pos {
                if fragment.read().get_long(HIER_POS_KEY) != Some(pos) {
                    self.put_value(fragment, HIER_POS_KEY, Value::Long(pos))?;
                }
            }
            i += 1;
        }
        if dest_id.is_none() {
            if let Some(src) = &source {
                if src.read().get_long(HIER_POS_KEY) != Some(i) {
                    self.put_value(src, HIER_POS_KEY, Value::Long(i))?;
                }
            }
        }
        Ok(())
    }

    /*
     * ----- Paths and ancestry -----
     */

    /// The path of a node, walking up the hierarchy.
    pub fn path_of(&mut self, fragment: &FragmentRef) -> StoreResult<String> {
        let mut names = Vec::new();
        let mut current = Arc::clone(fragment);
        loop {
            let (name, parent_id) = {
                let guard = current.read();
                (
                    guard.get_string(HIER_NAME_KEY).unwrap_or_default(),
                    guard.get_id(HIER_PARENT_KEY),
                )
            };
            names.push(name);
            let Some(parent_id) = parent_id else {
                break;
            };
            match self.get_hier(parent_id, true)? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        names.reverse();
        if names.len() == 1 {
            let name = &names[0];
            if name.is_empty() {
                // the root
                return Ok("/".to_owned());
            }
            // placeless document, no initial slash
            return Ok(name.clone());
        }
        Ok(names.join("/"))
    }

    /// The id of the enclosing non-complex-property node, or `None`
    /// when there is no parent or the parent chain has been deleted.
    pub fn containing_document(&mut self, id: DocId) -> StoreResult<Option<DocId>> {
        let mut pid = Some(id);
        while let Some(current) = pid {
            let Some(fragment) = self.get_hier(current, false)? else {
                return Ok(None);
            };
            if !Self::complex_prop(&fragment) {
                return Ok(Some(current));
            }
            pid = fragment.read().get_id(HIER_PARENT_KEY);
        }
        Ok(None)
    }

    /// Whether a node or any of its ancestors has been deleted.
    ///
    /// Needed because removal does not recursively clear caches for
    /// pristine descendants; lookups detect orphans by walking up.
    pub fn is_deleted(&mut self, id: DocId) -> StoreResult<bool> {
        let mut pid = Some(id);
        while let Some(current) = pid {
            let Some(fragment) = self.get_hier(current, false)? else {
                return Ok(true);
            };
            let (state, parent) = {
                let guard = fragment.read();
                (guard.state(), guard.get_id(HIER_PARENT_KEY))
            };
            if matches!(
                state,
                State::Absent | State::Deleted | State::InvalidatedDeleted
            ) {
                return Ok(true);
            }
            pid = parent;
        }
        Ok(false)
    }

    /// Rejects moving or copying a node under itself or one of its own
    /// descendants.
    pub(crate) fn check_not_under(
        &mut self,
        parent_id: DocId,
        id: DocId,
        operation: &str,
    ) -> StoreResult<()> {
        let mut pid = Some(parent_id);
        while let Some(current) = pid {
            if current == id {
                return Err(StoreError::structural_cycle(
                    operation,
                    format!("{parent_id} is under {id}"),
                ));
            }
            let Some(fragment) = self.get_hier(current, false)? else {
                return Err(StoreError::storage(format!("no parent: {current}")));
            };
            pid = fragment.read().get_id(HIER_PARENT_KEY);
        }
        Ok(())
    }

    /// Rejects a destination name already taken in the target parent.
    /// Cannot guard against concurrent sessions; the database constraint
    /// is the final arbiter.
    pub(crate) fn check_free_name(
        &mut self,
        parent_id: DocId,
        name: &str,
        complex: bool,
    ) -> StoreResult<()> {
        if self.get_child_by_name(parent_id, name, complex)?.is_some() {
            return Err(StoreError::document_exists(name));
        }
        Ok(())
    }

    /*
     * ----- Move / copy / remove -----
     */

    /// Moves a node to a new parent with a new name.
    ///
    /// The caller must have flushed pending changes first when the
    /// parents differ (an actual move, not a rename).
    pub fn move_node(&mut self, source: &Node, parent_id: DocId, name: &str) -> StoreResult<()> {
        let id = source.id();
        let hier = source.hier_fragment();
        let (old_parent_id, old_name) = {
            let guard = hier.read();
            (
                guard.get_id(HIER_PARENT_KEY),
                guard.get_string(HIER_NAME_KEY).unwrap_or_default(),
            )
        };
        if old_parent_id != Some(parent_id) {
            self.check_not_under(parent_id, id, "move")?;
        } else if old_name == name {
            // null move
            return Ok(());
        }
        let complex = Self::complex_prop(hier);
        self.check_free_name(parent_id, name, complex)?;

        if old_name != name {
            self.put_value(hier, HIER_NAME_KEY, Value::from(name))?;
        }
        if let Some(old_parent_id) = old_parent_id {
            self.hier_selection_mut(complex).record_removed(old_parent_id, id);
        }
        self.put_value(hier, HIER_PARENT_KEY, Value::Id(parent_id))?;
        self.hier_selection_mut(complex).record_existing(parent_id, id, true);
        Ok(())
    }

    /// Copies a node (deep) to a new parent with a new name; returns
    /// the id of the copy.
    pub fn copy_node(&mut self, source: &Node, parent_id: DocId, name: &str) -> StoreResult<DocId> {
        let id = source.id();
        let hier = source.hier_fragment();
        let old_parent_id = hier.read().get_id(HIER_PARENT_KEY);
        if old_parent_id.is_some() && old_parent_id != Some(parent_id) {
            self.check_not_under(parent_id, id, "copy")?;
        }
        self.check_free_name(parent_id, name, Self::complex_prop(hier))?;

        let pos = self.next_pos(parent_id, false)?;
        let mapper = Arc::clone(&self.mapper);
        let result = mapper.copy(
            &IdWithTypes::new(id, source.primary_type()),
            Some(parent_id),
            Some(name),
            None,
        )?;
        let new_id = result.copy_id;
        // read the new child in this session (updates the children
        // selection), then invalidate others
        let copy = self
            .get_hier(new_id, false)?
            .ok_or_else(|| StoreError::storage(format!("copy row missing: {new_id}")))?;
        self.mark_invalidated(&result.invalidations);

        // register the copied proxies in the proxy selections
        if self.model.proxies_enabled() && !result.proxy_ids.is_empty() {
            let row_ids: Vec<RowId> = result
                .proxy_ids
                .iter()
                .map(|proxy_id| RowId::new(PROXY_TABLE, *proxy_id))
                .collect();
            for fragment in self.get_multi(&row_ids, false)? {
                let (proxy_id, series, target) = {
                    let guard = fragment.read();
                    (
                        guard.id(),
                        guard.get_id(PROXY_VERSIONABLE_KEY),
                        guard.get_id(PROXY_TARGET_KEY),
                    )
                };
                if let Some(series) = series {
                    self.sel_mut(SelKind::SeriesProxies)?
                        .record_existing(series, proxy_id, true);
                }
                if let Some(target) = target {
                    self.sel_mut(SelKind::TargetProxies)?
                        .record_existing(target, proxy_id, true);
                }
            }
        }

        // a copy of a version is a plain document again
        if source.is_version() {
            self.put_value(&copy, MAIN_IS_VERSION_KEY, Value::Null)?;
        }
        self.put_value(
            &copy,
            HIER_POS_KEY,
            match pos {
                Some(pos) => Value::Long(pos),
                None => Value::Null,
            },
        )?;
        Ok(new_id)
    }

    /// Removes a document node and its descendants.
    ///
    /// Unflushed (created) children are removed recursively in memory,
    /// which is safe because they are fully resident. Pristine
    /// descendants are *not* recursively evicted; the database removal
    /// is recursive and later lookups detect orphans through
    /// [`PersistenceContext::is_deleted`].
    pub fn remove_node(&mut self, hier: &FragmentRef) -> StoreResult<()> {
        let (id, state, primary_type, is_version, is_property, parent_id) = {
            let guard = hier.read();
            (
                guard.id(),
                guard.state(),
                guard.get_string(MAIN_PRIMARY_TYPE_KEY).unwrap_or_default(),
                guard.is_true(MAIN_IS_VERSION_KEY),
                guard.is_true(HIER_IS_PROPERTY_KEY),
                guard.get_id(HIER_PARENT_KEY),
            )
        };

        // root info before deletion; may be a version or a proxy
        let mut version_series_id = None;
        let mut target_id = None;
        if primary_type == PROXY_TYPE {
            if let Some(proxy) = self.get(&RowId::new(PROXY_TABLE, id), true)? {
                let guard = proxy.read();
                version_series_id = guard.get_id(PROXY_VERSIONABLE_KEY);
                target_id = guard.get_id(PROXY_TARGET_KEY);
            }
        } else if is_version {
            if let Some(version) = self.get(&RowId::new(VERSION_TABLE, id), true)? {
                version_series_id = version.read().get_id(VERSION_VERSIONABLE_KEY);
            }
        }

        if state == State::Created {
            // unflushed: children are in memory too, recurse
            for child in self.get_children(id, None, true)? {
                self.remove_node(&child)?;
            }
            for child in self.get_children(id, None, false)? {
                self.remove_node(&child)?;
            }
            self.remove_fragments_of(id, &primary_type)?;
            let info = NodeInfo {
                id,
                parent_id,
                primary_type,
                is_property,
                version_series_id,
                target_id,
            };
            self.remove_from_selections(&info)?;
        } else {
            let root_info = NodeInfo {
                id,
                parent_id,
                primary_type,
                is_property,
                version_series_id,
                target_id,
            };
            // remove in the database with descendants; the mapper tells
            // us everything it removed so we can fix caches
            let mapper = Arc::clone(&self.mapper);
            let infos = mapper.remove(&root_info)?;
            for info in &infos {
                for fragment_name in self.model.type_fragments(&info.primary_type)? {
                    self.removed_fragment(&RowId::new(fragment_name, info.id))?;
                }
                self.removed_fragment(&RowId::new(VERSION_TABLE, info.id))?;
                self.removed_fragment(&RowId::new(PROXY_TABLE, info.id))?;
                self.remove_from_selections(info)?;
            }
        }

        // only the root can be a version; versions are not fileable
        if is_version {
            if let Some(series) = version_series_id {
                self.recompute_version_series(series)?;
            }
        }
        Ok(())
    }

    /// Removes a complex-property node and its children.
    ///
    /// Less work than a document node: fewer selections, and the depth
    /// is small enough to recurse.
    pub fn remove_property_node(&mut self, hier: &FragmentRef) -> StoreResult<()> {
        let mut todo: VecDeque<FragmentRef> = VecDeque::new();
        let mut collected: Vec<FragmentRef> = Vec::new();
        todo.push_back(Arc::clone(hier));
        while let Some(fragment) = todo.pop_front() {
            let id = fragment.read().id();
            todo.extend(self.get_children(id, None, true)?);
            collected.push(fragment);
        }
        // depth first
        for fragment in collected.iter().rev() {
            let (id, primary_type, parent_id) = {
                let guard = fragment.read();
                (
                    guard.id(),
                    guard.get_string(MAIN_PRIMARY_TYPE_KEY).unwrap_or_default(),
                    guard.get_id(HIER_PARENT_KEY),
                )
            };
            self.remove_fragments_of(id, &primary_type)?;
            if let Some(parent_id) = parent_id {
                self.hier_selection_mut(true).record_removed(parent_id, id);
            }
            // no children anymore
            self.hier_selection_mut(true).record_removed_selection(id);
        }
        Ok(())
    }

    /// Marks deleted every fragment of one node that this context could
    /// hold (hierarchy, ACLs, data fragments, version/proxy rows).
    fn remove_fragments_of(&mut self, id: DocId, primary_type: &str) -> StoreResult<()> {
        let mut fragment_names = self.model.type_fragments(primary_type)?;
        fragment_names.push(VERSION_TABLE.to_owned());
        fragment_names.push(PROXY_TABLE.to_owned());
        for fragment_name in fragment_names {
            let row_id = RowId::new(fragment_name, id);
            if let Some(fragment) = self.get(&row_id, true)? {
                let state = fragment.read().state();
                if state != State::Deleted && state != State::Detached {
                    self.remove_fragment(&fragment)?;
                }
            }
        }
        Ok(())
    }

    /// Removes a node from the children and proxy selections.
    fn remove_from_selections(&mut self, info: &NodeInfo) -> StoreResult<()> {
        let id = info.id;
        let proxies = self.model.proxies_enabled();
        if proxies && info.primary_type == PROXY_TYPE {
            if let Some(series) = info.version_series_id {
                self.sel_mut(SelKind::SeriesProxies)?.record_removed(series, id);
            }
            if let Some(target) = info.target_id {
                self.sel_mut(SelKind::TargetProxies)?.record_removed(target, id);
            }
        }
        if info.version_series_id.is_some() && info.target_id.is_none() {
            // a version
            if let Some(series) = info.version_series_id {
                self.series_versions.record_removed(series, id);
            }
        }
        if let Some(parent_id) = info.parent_id {
            self.hier_complex.record_removed(parent_id, id);
            self.hier_non_complex.record_removed(parent_id, id);
        }

        // drop the selections the removed node owned
        self.hier_complex.record_removed_selection(id);
        if !info.is_property {
            self.hier_non_complex.record_removed_selection(id);
            self.series_versions.record_removed_selection(id);
            if proxies {
                self.sel_mut(SelKind::SeriesProxies)?.record_removed_selection(id);
                self.sel_mut(SelKind::TargetProxies)?.record_removed_selection(id);
            }
        }
        Ok(())
    }
}
