//! The persistence context: a session-scoped, write-behind unit of work.
//!
//! All non-saved modified data is referenced here. At save time it is
//! drained into a [`RowBatch`] and sent to the mapper; the database is
//! committed later by the transaction control in effect.
//!
//! Internally a fragment is in at most one of the pristine or modified
//! maps. After a save every fragment is pristine, and may be partially
//! invalidated after commit by other sessions that committed too.
//!
//! The context is tied to one session and one thread; cross-thread use
//! is rejected.

mod hierarchy;
mod versioning;

use crate::config::StoreConfig;
use crate::fragment::{Fragment, FragmentRef, State};
use crate::lru::LruMap;
use crate::selection::SelectionContext;
use crate::stats::CacheStats;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::warn;
use vellum_mapper::{
    Invalidations, Row, RowBatch, RowId, RowMapper, RowRead, SelectionType, StoreError,
    StoreResult,
};
use vellum_model::{DocId, FulltextKind, Model, HIER_TABLE};

/// Internal name for one of the context's selection caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelKind {
    /// Complex-property children by parent.
    HierComplex,
    /// Regular children by parent.
    HierNonComplex,
    /// Versions by series.
    SeriesVersions,
    /// Proxies by series.
    SeriesProxies,
    /// Proxies by target.
    TargetProxies,
}

/// Session-scoped unit of work over a [`RowMapper`].
///
/// Owns every fragment the session has seen, in two maps:
/// - `pristine`: identical to the database; a bounded LRU that never
///   evicts a fragment still referenced outside the cache, so the
///   application always gets the same fragment object for the same row
/// - `modified`: created / modified / deleted fragments, held until
///   [`PersistenceContext::get_save_batch`] drains them
pub struct PersistenceContext {
    model: Arc<Model>,
    mapper: Arc<dyn RowMapper>,
    pristine: LruMap<RowId, FragmentRef>,
    modified: HashMap<RowId, FragmentRef>,
    /// Ids generated but not yet saved, in creation order (parents
    /// before children, for foreign keys). Proves "this id cannot exist
    /// in the database" without a round-trip.
    created_ids: Vec<DocId>,
    created_set: HashSet<DocId>,
    hier_complex: SelectionContext,
    hier_non_complex: SelectionContext,
    series_versions: SelectionContext,
    series_proxies: Option<SelectionContext>,
    target_proxies: Option<SelectionContext>,
    stats: CacheStats,
    owner_thread: ThreadId,
}

impl PersistenceContext {
    /// Creates a context bound to the calling thread.
    #[must_use]
    pub fn new(model: Arc<Model>, mapper: Arc<dyn RowMapper>, config: &StoreConfig) -> Self {
        let sel_size = config.selection_cache_size;
        let proxies = model.proxies_enabled();
        Self {
            model,
            mapper,
            pristine: LruMap::with_evict_check(config.pristine_cache_size, |fragment| {
                // a fragment still referenced by the application (a node,
                // a selection walk) must stay addressable here
                Arc::strong_count(fragment) == 1
            }),
            modified: HashMap::new(),
            created_ids: Vec::new(),
            created_set: HashSet::new(),
            hier_complex: SelectionContext::new(SelectionType::ChildrenComplex, sel_size),
            hier_non_complex: SelectionContext::new(SelectionType::ChildrenRegular, sel_size),
            series_versions: SelectionContext::new(SelectionType::SeriesVersions, sel_size),
            series_proxies: proxies
                .then(|| SelectionContext::new(SelectionType::SeriesProxies, sel_size)),
            target_proxies: proxies
                .then(|| SelectionContext::new(SelectionType::TargetProxies, sel_size)),
            stats: CacheStats::new(),
            owner_thread: thread::current().id(),
        }
    }

    /// The model this context maps through.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The mapper this context reads and writes through.
    #[must_use]
    pub fn mapper(&self) -> &Arc<dyn RowMapper> {
        &self.mapper
    }

    /// Cache lookup statistics.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Rejects use from any thread but the one that created the
    /// context. Sessions are single-threaded by design; concurrency
    /// lives in the invalidation protocol, not here.
    pub fn check_thread(&self) -> StoreResult<()> {
        if thread::current().id() != self.owner_thread {
            return Err(StoreError::invalid_state(
                "session used from a thread other than its owner",
            ));
        }
        Ok(())
    }

    pub(crate) fn sel_mut(&mut self, kind: SelKind) -> StoreResult<&mut SelectionContext> {
        match kind {
            SelKind::HierComplex => Ok(&mut self.hier_complex),
            SelKind::HierNonComplex => Ok(&mut self.hier_non_complex),
            SelKind::SeriesVersions => Ok(&mut self.series_versions),
            SelKind::SeriesProxies => self
                .series_proxies
                .as_mut()
                .ok_or_else(|| StoreError::invalid_operation("proxies are disabled")),
            SelKind::TargetProxies => self
                .target_proxies
                .as_mut()
                .ok_or_else(|| StoreError::invalid_operation("proxies are disabled")),
        }
    }

    fn selections_mut(&mut self) -> Vec<&mut SelectionContext> {
        let mut all = vec![
            &mut self.hier_complex,
            &mut self.hier_non_complex,
            &mut self.series_versions,
        ];
        if let Some(sel) = self.series_proxies.as_mut() {
            all.push(sel);
        }
        if let Some(sel) = self.target_proxies.as_mut() {
            all.push(sel);
        }
        all
    }

    /*
     * ----- Id management -----
     */

    /// Generates a new id (or adopts a pre-generated one, for imports)
    /// and records it as created-but-unflushed.
    pub fn generate_new_id(&mut self, id: Option<DocId>) -> DocId {
        let id = id.unwrap_or_else(|| self.model.generate_new_id());
        self.created_ids.push(id);
        self.created_set.insert(id);
        id
    }

    /// Whether an id was generated in this session and not yet saved,
    /// which proves it cannot exist in the database.
    #[must_use]
    pub fn is_id_new(&self, id: DocId) -> bool {
        self.created_set.contains(&id)
    }

    /*
     * ----- Fragment lookup and registration -----
     */

    /// Gets a fragment if the context already holds it.
    pub fn get_if_present(&mut self, row_id: &RowId) -> Option<FragmentRef> {
        self.stats.record_lookup();
        let fragment = self
            .pristine
            .get(row_id)
            .cloned()
            .or_else(|| self.modified.get(row_id).cloned());
        if fragment.is_some() {
            self.stats.record_hit();
        }
        fragment
    }

    /// Gets a fragment, fetching it from the mapper on a miss.
    ///
    /// With `allow_absent`, a row missing from the database is returned
    /// as an absent fragment; otherwise `None`.
    pub fn get(&mut self, row_id: &RowId, allow_absent: bool) -> StoreResult<Option<FragmentRef>> {
        if let Some(fragment) = self.get_if_present(row_id) {
            self.ensure_fresh(&fragment)?;
            return Ok(Some(fragment));
        }
        let mut fetched = self.get_from_mapper(vec![row_id.clone()], allow_absent, false)?;
        Ok(fetched.pop())
    }

    /// Batch variant of [`PersistenceContext::get`]: fragments already
    /// present are reused, the rest are fetched in one mapper call.
    /// Deleted fragments are skipped; order is not preserved.
    pub fn get_multi(
        &mut self,
        row_ids: &[RowId],
        allow_absent: bool,
    ) -> StoreResult<Vec<FragmentRef>> {
        let mut result = Vec::with_capacity(row_ids.len());
        let mut todo = Vec::new();
        for row_id in row_ids {
            match self.get_if_present(row_id) {
                Some(fragment) => {
                    let state = fragment.read().state();
                    if state != State::Deleted && (state != State::Absent || allow_absent) {
                        self.ensure_fresh(&fragment)?;
                        result.push(fragment);
                    }
                }
                None => todo.push(row_id.clone()),
            }
        }
        if !todo.is_empty() {
            result.extend(self.get_from_mapper(todo, allow_absent, false)?);
        }
        Ok(result)
    }

    /// Fetches fragments from the mapper, short-circuiting ids known to
    /// be new (nothing can exist in the database for them).
    pub(crate) fn get_from_mapper(
        &mut self,
        row_ids: Vec<RowId>,
        allow_absent: bool,
        cache_only: bool,
    ) -> StoreResult<Vec<FragmentRef>> {
        let mut result = Vec::with_capacity(row_ids.len());
        let mut todo = Vec::new();
        for row_id in row_ids {
            if self.is_id_new(row_id.id) {
                if let Some(fragment) =
                    self.fragment_from_read(RowRead::Absent(row_id), allow_absent)?
                {
                    result.push(fragment);
                }
            } else {
                todo.push(row_id);
            }
        }
        if todo.is_empty() {
            return Ok(result);
        }
        let mapper = Arc::clone(&self.mapper);
        for read in mapper.read(&todo, cache_only)? {
            if cache_only && matches!(read, RowRead::Absent(_)) {
                // not in any cache; the caller asked us not to go to the
                // database, so report nothing rather than a false absence
                continue;
            }
            if let Some(fragment) = self.fragment_from_read(read, allow_absent)? {
                result.push(fragment);
            }
        }
        Ok(result)
    }

    /// Turns freshly fetched selection rows into registered fragments.
    pub(crate) fn fragments_from_fetched_rows(
        &mut self,
        rows: Vec<Row>,
        allow_absent: bool,
    ) -> StoreResult<Vec<FragmentRef>> {
        let mut fragments = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(fragment) = self.fragment_from_read(RowRead::Found(row), allow_absent)? {
                fragments.push(fragment);
            }
        }
        Ok(fragments)
    }

    /// Turns one fetched row (or absence) into a fragment recorded in
    /// the context.
    ///
    /// If the context already holds a fragment for the id it is reused:
    /// a deleted one yields `None`, an invalidated one is refreshed from
    /// the fetched data.
    pub(crate) fn fragment_from_read(
        &mut self,
        read: RowRead,
        allow_absent: bool,
    ) -> StoreResult<Option<FragmentRef>> {
        let row_id = read.row_id().clone();
        if let Some(fragment) = self.get_if_present(&row_id) {
            let state = fragment.read().state();
            match state {
                State::Deleted => return Ok(None),
                State::InvalidatedModified | State::InvalidatedDeleted => {
                    let data = match read {
                        RowRead::Found(row) => Some(row.data),
                        RowRead::Absent(_) => None,
                    };
                    fragment.write().refetched(data)?;
                    return Ok(Some(fragment));
                }
                _ => return Ok(Some(fragment)),
            }
        }
        let is_collection = self.model.is_collection_fragment(&row_id.table);
        let fragment = match read {
            RowRead::Found(row) => {
                let fragment = Fragment::from_row(row, State::Pristine).into_ref();
                if !is_collection {
                    self.record_existing_in_selections(&fragment, false);
                }
                fragment
            }
            RowRead::Absent(row_id) => {
                if !allow_absent {
                    return Ok(None);
                }
                if is_collection {
                    Fragment::absent_collection(row_id).into_ref()
                } else {
                    Fragment::absent_simple(row_id).into_ref()
                }
            }
        };
        self.pristine.insert(row_id, Arc::clone(&fragment));
        Ok(Some(fragment))
    }

    fn record_existing_in_selections(&mut self, fragment: &FragmentRef, invalidate: bool) {
        let guard = fragment.read();
        for sel in self.selections_mut() {
            if sel.applicable(&guard) {
                if let Some(sel_id) = sel.selection_id_of(&guard) {
                    sel.record_existing(sel_id, guard.id(), invalidate);
                }
            }
        }
    }

    /// Refetches an invalidated fragment before it is used.
    pub(crate) fn ensure_fresh(&mut self, fragment: &FragmentRef) -> StoreResult<()> {
        let (row_id, invalidated, is_collection) = {
            let guard = fragment.read();
            (
                guard.row_id().clone(),
                guard.state().is_invalidated(),
                guard.is_collection(),
            )
        };
        if !invalidated {
            return Ok(());
        }
        let mapper = Arc::clone(&self.mapper);
        let fetched = if is_collection {
            mapper.read_collection_array(&row_id)?
        } else {
            mapper.read_simple_row(&row_id)?
        };
        fragment.write().refetched(fetched.map(|row| row.data))
    }

    /*
     * ----- Fragment creation -----
     */

    /// Creates a fragment for a new row.
    ///
    /// Fails if a fragment with that row id is already registered,
    /// which prevents double creation.
    pub fn create_simple_fragment(&mut self, row: Row) -> StoreResult<FragmentRef> {
        let row_id = row.id.clone();
        if self.pristine.contains_key(&row_id) || self.modified.contains_key(&row_id) {
            return Err(StoreError::invalid_operation(format!(
                "row already registered: {row_id}"
            )));
        }
        let fragment = Fragment::from_row(row, State::Created).into_ref();
        self.modified.insert(row_id, Arc::clone(&fragment));
        Ok(fragment)
    }

    /// Creates a new hierarchy fragment, recording it as a created
    /// child of its parent and priming its own (empty) child
    /// selections.
    pub fn create_hierarchy_fragment(&mut self, row: Row) -> StoreResult<FragmentRef> {
        let fragment = self.create_simple_fragment(row)?;
        let (id, parent_id, complex) = {
            let guard = fragment.read();
            (
                guard.id(),
                guard.get_id(vellum_model::HIER_PARENT_KEY),
                guard.is_true(vellum_model::HIER_IS_PROPERTY_KEY),
            )
        };
        if let Some(parent_id) = parent_id {
            self.hier_selection_mut(complex).record_created(parent_id, id);
        }
        // a brand-new node has no children yet
        self.hier_complex.new_selection(id);
        self.hier_non_complex.new_selection(id);
        Ok(fragment)
    }

    pub(crate) fn hier_selection_mut(&mut self, complex: bool) -> &mut SelectionContext {
        if complex {
            &mut self.hier_complex
        } else {
            &mut self.hier_non_complex
        }
    }

    /// Creates the bookkeeping fragment of a new version and records it
    /// in the series selection.
    pub fn create_version_fragment(&mut self, row: Row) -> StoreResult<FragmentRef> {
        let fragment = self.create_simple_fragment(row)?;
        let (id, series) = {
            let guard = fragment.read();
            (guard.id(), guard.get_id(vellum_model::VERSION_VERSIONABLE_KEY))
        };
        if let Some(series) = series {
            self.series_versions.record_created(series, id);
        }
        if self.model.proxies_enabled() {
            // no proxies point at this brand-new version
            self.sel_mut(SelKind::TargetProxies)?.new_selection(id);
        }
        Ok(fragment)
    }

    /// Records a created proxy fragment in the proxy selections.
    pub fn created_proxy_fragment(&mut self, fragment: &FragmentRef) -> StoreResult<()> {
        if !self.model.proxies_enabled() {
            return Ok(());
        }
        let (id, series, target) = {
            let guard = fragment.read();
            (
                guard.id(),
                guard.get_id(vellum_model::PROXY_VERSIONABLE_KEY),
                guard.get_id(vellum_model::PROXY_TARGET_KEY),
            )
        };
        if let Some(series) = series {
            self.sel_mut(SelKind::SeriesProxies)?.record_created(series, id);
        }
        if let Some(target) = target {
            self.sel_mut(SelKind::TargetProxies)?.record_created(target, id);
        }
        Ok(())
    }

    /*
     * ----- Mutation through the context -----
     */

    /// Writes a keyed value on a fragment, keeping the pristine and
    /// modified maps in sync with the fragment's state.
    pub fn put_value(
        &mut self,
        fragment: &FragmentRef,
        key: &str,
        value: vellum_mapper::Value,
    ) -> StoreResult<()> {
        self.ensure_fresh(fragment)?;
        let moved = fragment.write().put(key, value)?;
        if moved {
            self.set_fragment_modified(fragment);
        }
        Ok(())
    }

    /// Reads a keyed value, refetching first when invalidated.
    pub fn get_value(&mut self, fragment: &FragmentRef, key: &str) -> StoreResult<vellum_mapper::Value> {
        self.ensure_fresh(fragment)?;
        Ok(fragment.read().get(key))
    }

    /// Replaces a collection fragment's array.
    pub fn set_array(
        &mut self,
        fragment: &FragmentRef,
        values: Vec<vellum_mapper::Value>,
    ) -> StoreResult<()> {
        self.ensure_fresh(fragment)?;
        let moved = fragment.write().set_array(values)?;
        if moved {
            self.set_fragment_modified(fragment);
        }
        Ok(())
    }

    /// Reads a collection fragment's array.
    pub fn get_array(&mut self, fragment: &FragmentRef) -> StoreResult<Vec<vellum_mapper::Value>> {
        self.ensure_fresh(fragment)?;
        Ok(fragment.read().array().to_vec())
    }

    pub(crate) fn set_fragment_modified(&mut self, fragment: &FragmentRef) {
        let row_id = fragment.read().row_id().clone();
        self.pristine.remove(&row_id);
        self.modified.insert(row_id, Arc::clone(fragment));
    }

    pub(crate) fn set_fragment_pristine(&mut self, fragment: &FragmentRef) {
        let row_id = fragment.read().row_id().clone();
        self.modified.remove(&row_id);
        self.pristine.insert(row_id, Arc::clone(fragment));
    }

    /*
     * ----- Save -----
     */

    /// Drains all created, modified and deleted fragments into a batch
    /// for the mapper.
    ///
    /// Created main rows come first, in creation order, because other
    /// tables reference them as foreign keys. Updates carry only the
    /// actually-dirty keys. Calling this twice without intervening
    /// mutation yields an empty batch the second time.
    pub fn get_save_batch(&mut self) -> StoreResult<RowBatch> {
        self.check_thread()?;
        let mut batch = RowBatch::new();

        // created main rows first (in creation order, for foreign keys)
        for id in std::mem::take(&mut self.created_ids) {
            let row_id = RowId::new(HIER_TABLE, id);
            let Some(fragment) = self.modified.remove(&row_id) else {
                // created then deleted before save
                continue;
            };
            batch.creates.push(fragment.read().to_row());
            fragment.write().set_pristine()?;
            self.pristine.insert(row_id, fragment);
        }
        self.created_set.clear();

        // then everything else
        for (row_id, fragment) in std::mem::take(&mut self.modified) {
            let state = fragment.read().state();
            match state {
                State::Created => {
                    batch.creates.push(fragment.read().to_row());
                    fragment.write().set_pristine()?;
                    self.pristine.insert(row_id, fragment);
                }
                State::Modified => {
                    if let Some(update) = fragment.read().row_update() {
                        batch.updates.push(update);
                    }
                    fragment.write().set_pristine()?;
                    self.pristine.insert(row_id, fragment);
                }
                State::Deleted => {
                    batch.deletes.push(row_id);
                    fragment.write().set_detached()?;
                }
                State::Pristine => {
                    // should not happen; put it back where it belongs
                    warn!(%row_id, "pristine fragment found in modified map");
                    self.pristine.insert(row_id, fragment);
                }
                other => {
                    return Err(StoreError::invalid_state(format!(
                        "fragment {row_id} in state {other:?} during save"
                    )))
                }
            }
        }

        // flush selection caches (hard entries demote to soft)
        for sel in self.selections_mut() {
            sel.post_save();
        }

        Ok(batch)
    }

    /// Finds the documents whose changed fields make them dirty for
    /// fulltext reindexing, before a save drains the modified map.
    ///
    /// Documents wholly deleted need no reindexing and are excluded.
    pub fn find_dirty_documents(
        &mut self,
        dirty_strings: &mut HashSet<DocId>,
        dirty_binaries: &mut HashSet<DocId>,
    ) -> StoreResult<()> {
        let fragments: Vec<FragmentRef> = self.modified.values().cloned().collect();
        let mut deleted_docs: HashSet<DocId> = HashSet::new();
        for fragment in fragments {
            let (id, table, state, dirty_keys, is_collection) = {
                let guard = fragment.read();
                (
                    guard.id(),
                    guard.table().to_owned(),
                    guard.state(),
                    guard.dirty_keys(),
                    guard.is_collection(),
                )
            };
            let Some(doc_id) = self.containing_document(id)? else {
                continue;
            };
            match state {
                State::Deleted => {
                    if table == HIER_TABLE && id == doc_id {
                        deleted_docs.insert(doc_id);
                        continue;
                    }
                    if self.is_deleted(doc_id)? {
                        continue;
                    }
                    // a deleted complex-property fragment of a document
                    // that survives: the whole fragment's text is gone
                    if let Some(kind) = self.model.fulltext_info_for_fragment(&table) {
                        mark_fulltext(kind, doc_id, dirty_strings, dirty_binaries);
                    }
                }
                State::Created => {
                    if let Some(kind) = self.model.fulltext_info_for_fragment(&table) {
                        mark_fulltext(kind, doc_id, dirty_strings, dirty_binaries);
                    }
                }
                State::Modified => {
                    if is_collection {
                        if let Some(kind) = self.model.fulltext_info_for_fragment(&table) {
                            mark_fulltext(kind, doc_id, dirty_strings, dirty_binaries);
                        }
                    } else {
                        for key in dirty_keys {
                            if let Some(kind) = self.model.fulltext_field_kind(&table, &key) {
                                mark_fulltext(kind, doc_id, dirty_strings, dirty_binaries);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        for doc_id in deleted_docs {
            dirty_strings.remove(&doc_id);
            dirty_binaries.remove(&doc_id);
        }
        Ok(())
    }

    /*
     * ----- Invalidations -----
     */

    /// Gathers this session's selection invalidations and hands them to
    /// the mapper for post-commit propagation.
    pub fn send_invalidations_to_others(&mut self) -> StoreResult<()> {
        let mut invalidations = Invalidations::new();
        for sel in self.selections_mut() {
            sel.gather_invalidations(&mut invalidations);
        }
        self.mapper.send_invalidations(&invalidations)
    }

    /// Drains invalidations other sessions addressed to us and applies
    /// them to the local caches. Called pre-transaction.
    pub fn process_received_invalidations(&mut self) -> StoreResult<()> {
        let mapper = Arc::clone(&self.mapper);
        if let Some(invalidations) = mapper.receive_invalidations()? {
            self.process_cache_invalidations(&invalidations);
        }
        Ok(())
    }

    fn process_cache_invalidations(&mut self, invalidations: &Invalidations) {
        if invalidations.all {
            self.clear_local_caches();
        }
        for row_id in &invalidations.modified {
            if let Some(fragment) = self.pristine.remove(row_id) {
                if let Err(error) = fragment.write().set_invalidated_modified() {
                    warn!(%row_id, %error, "cannot invalidate fragment");
                }
            }
        }
        for sel in self.selections_mut() {
            sel.process_received_invalidations(&invalidations.modified);
        }
        for row_id in &invalidations.deleted {
            if let Some(fragment) = self.pristine.remove(row_id) {
                if let Err(error) = fragment.write().set_invalidated_deleted() {
                    warn!(%row_id, %error, "cannot invalidate fragment");
                }
            }
        }
    }

    /// Marks locally the invalidations gathered by a mapper operation
    /// in this very session (copy, version restore): affected fragments
    /// go stale and will refetch lazily, selections lose completeness,
    /// and the changes propagate to other sessions at commit.
    pub fn mark_invalidated(&mut self, invalidations: &Invalidations) {
        for row_id in &invalidations.modified {
            if let Some(fragment) = self.get_if_present(row_id) {
                self.set_fragment_pristine(&fragment);
                if let Err(error) = fragment.write().set_invalidated_modified() {
                    warn!(%row_id, %error, "cannot invalidate fragment");
                }
            }
        }
        for sel in self.selections_mut() {
            sel.mark_invalidated(&invalidations.modified);
        }
        for row_id in &invalidations.deleted {
            if let Some(fragment) = self.get_if_present(row_id) {
                self.set_fragment_pristine(&fragment);
                if let Err(error) = fragment.write().set_invalidated_deleted() {
                    warn!(%row_id, %error, "cannot invalidate fragment");
                }
            }
        }
    }

    /*
     * ----- Removal bookkeeping -----
     */

    /// Deletes a fragment from the context; the database delete happens
    /// at flush (or was already done by a recursive mapper removal).
    pub fn remove_fragment(&mut self, fragment: &FragmentRef) -> StoreResult<()> {
        let (row_id, state) = {
            let guard = fragment.read();
            (guard.row_id().clone(), guard.state())
        };
        match state {
            State::Absent | State::InvalidatedDeleted => {
                self.pristine.remove(&row_id);
            }
            State::Created => {
                self.modified.remove(&row_id);
            }
            State::Pristine | State::InvalidatedModified => {
                self.pristine.remove(&row_id);
                self.modified.insert(row_id, Arc::clone(fragment));
            }
            State::Modified => {
                // already in the modified map
            }
            State::Detached | State::Deleted => return Ok(()),
        }
        fragment.write().set_deleted()
    }

    /// Cleans up after a fragment's row was removed in the database by
    /// a recursive mapper removal.
    pub(crate) fn removed_fragment(&mut self, row_id: &RowId) -> StoreResult<()> {
        let Some(fragment) = self.get_if_present(row_id) else {
            return Ok(());
        };
        let state = fragment.read().state();
        match state {
            State::Absent
            | State::Pristine
            | State::InvalidatedModified
            | State::InvalidatedDeleted => {
                self.pristine.remove(row_id);
            }
            State::Created | State::Modified | State::Deleted => {
                warn!(%row_id, ?state, "removed fragment was in invalid state");
                self.modified.remove(row_id);
            }
            State::Detached => {}
        }
        let result = fragment.write().set_detached();
        result
    }

    /*
     * ----- Cache management -----
     */

    /// Drops every local cache, the mapper's included. Pending modified
    /// fragments are discarded too; only call when rolling back.
    pub fn clear_caches(&mut self) -> usize {
        self.mapper.clear_cache();
        let n = self.clear_local_caches();
        self.modified.clear();
        self.created_ids.clear();
        self.created_set.clear();
        n
    }

    fn clear_local_caches(&mut self) -> usize {
        for sel in self.selections_mut() {
            sel.clear_caches();
        }
        let n = self.pristine.len();
        self.pristine.clear();
        n
    }

    /// Number of pristine fragments held.
    #[must_use]
    pub fn cache_pristine_size(&self) -> usize {
        self.pristine.len()
    }

    /// Number of cached selections across all selection contexts.
    #[must_use]
    pub fn cache_selection_size(&self) -> usize {
        let mut size = self.hier_complex.len() + self.hier_non_complex.len()
            + self.series_versions.len();
        if let Some(sel) = &self.series_proxies {
            size += sel.len();
        }
        if let Some(sel) = &self.target_proxies {
            size += sel.len();
        }
        size
    }

    /// Total cache footprint: pristine fragments, selections and the
    /// mapper's own cache.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache_pristine_size() + self.cache_selection_size() + self.mapper.cache_size()
    }

    /// Whether the context holds unflushed changes.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.modified.is_empty() || !self.created_ids.is_empty()
    }
}

fn mark_fulltext(
    kind: FulltextKind,
    doc_id: DocId,
    dirty_strings: &mut HashSet<DocId>,
    dirty_binaries: &mut HashSet<DocId>,
) {
    if kind.dirties_strings() {
        dirty_strings.insert(doc_id);
    }
    if kind.dirties_binaries() {
        dirty_binaries.insert(doc_id);
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("pristine", &self.pristine.len())
            .field("modified", &self.modified.len())
            .field("created_ids", &self.created_ids.len())
            .finish_non_exhaustive()
    }
}
